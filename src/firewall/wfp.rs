use crate::firewall::rules::{Action, Condition, Layer};
use crate::firewall::{FilterEngine, FilterSpec, FirewallError, Provider, Sublayer};
use std::net::IpAddr;
use uuid::Uuid;
use windows::Win32::Foundation::{HANDLE, HLOCAL, LocalFree};
use windows::Win32::NetworkManagement::WindowsFilteringPlatform::*;
use windows::Win32::Security::Authorization::{GetSecurityInfo, SE_KERNEL_OBJECT};
use windows::Win32::Security::{
    DACL_SECURITY_INFORMATION, GetSecurityDescriptorLength, PSECURITY_DESCRIPTOR,
};
use windows::Win32::System::Rpc::RPC_C_AUTHN_WINNT;
use windows::Win32::System::Threading::{GetCurrentProcess, INFINITE};
use windows::core::{GUID, HSTRING, PCWSTR, PWSTR};

fn guid(uuid: Uuid) -> GUID {
    GUID::from_u128(uuid.as_u128())
}

fn check(operation: &'static str, code: u32) -> Result<(), FirewallError> {
    match code {
        0 => Ok(()),
        code => Err(FirewallError::Engine { operation, code }),
    }
}

/// Wide strings referenced by display data must outlive the call.
struct DisplayData {
    name: HSTRING,
    description: HSTRING,
}

impl DisplayData {
    fn new(name: &str, description: &str) -> Self {
        Self {
            name: HSTRING::from(name),
            description: HSTRING::from(description),
        }
    }

    fn raw(&self) -> FWPM_DISPLAY_DATA0 {
        FWPM_DISPLAY_DATA0 {
            name: PWSTR(self.name.as_ptr() as *mut u16),
            description: PWSTR(self.description.as_ptr() as *mut u16),
        }
    }
}

/// Values that filter conditions point at. Boxed so the pointers stay valid
/// while the conditions vector is built.
#[derive(Default)]
struct ConditionValues {
    luids: Vec<Box<u64>>,
    v6_addresses: Vec<Box<FWP_BYTE_ARRAY16>>,
    v4_masks: Vec<Box<FWP_V4_ADDR_AND_MASK>>,
    v6_masks: Vec<Box<FWP_V6_ADDR_AND_MASK>>,
}

/// Windows Filtering Platform engine. Each session is dynamic, so closing it
/// removes every provider, sublayer and filter created under it.
pub struct WfpEngine {
    handle: Option<HANDLE>,
    app_id: *mut FWP_BYTE_BLOB,
    process_sd: Option<(PSECURITY_DESCRIPTOR, u32)>,
}

// The engine handle is only used through `&mut self`.
unsafe impl Send for WfpEngine {}

impl Default for WfpEngine {
    fn default() -> Self {
        Self {
            handle: None,
            app_id: std::ptr::null_mut(),
            process_sd: None,
        }
    }
}

impl WfpEngine {
    fn handle(&self) -> Result<HANDLE, FirewallError> {
        self.handle
            .ok_or(FirewallError::InvalidState("no open session"))
    }

    fn current_process_app_id(&mut self) -> Result<*mut FWP_BYTE_BLOB, FirewallError> {
        if !self.app_id.is_null() {
            return Ok(self.app_id);
        }
        let exe = std::env::current_exe()
            .map_err(|_| FirewallError::InvalidState("unable to resolve executable path"))?;
        let exe = HSTRING::from(exe.as_os_str());
        let mut app_id: *mut FWP_BYTE_BLOB = std::ptr::null_mut();
        unsafe {
            check(
                "FwpmGetAppIdFromFileName0",
                FwpmGetAppIdFromFileName0(PCWSTR(exe.as_ptr()), &mut app_id),
            )?;
        }
        self.app_id = app_id;
        Ok(app_id)
    }

    fn current_process_sd(&mut self) -> Result<FWP_BYTE_BLOB, FirewallError> {
        if self.process_sd.is_none() {
            let mut sd = PSECURITY_DESCRIPTOR::default();
            unsafe {
                let result = GetSecurityInfo(
                    GetCurrentProcess(),
                    SE_KERNEL_OBJECT,
                    DACL_SECURITY_INFORMATION,
                    None,
                    None,
                    None,
                    None,
                    Some(&mut sd),
                );
                check("GetSecurityInfo", result.0)?;
                let length = GetSecurityDescriptorLength(sd);
                self.process_sd = Some((sd, length));
            }
        }
        let (sd, length) = self
            .process_sd
            .ok_or(FirewallError::InvalidState("missing security descriptor"))?;
        Ok(FWP_BYTE_BLOB {
            size: length,
            data: sd.0 as *mut u8,
        })
    }

    fn build_conditions(
        &mut self,
        conditions: &[Condition],
        values: &mut ConditionValues,
        sd_blob: &mut Option<Box<FWP_BYTE_BLOB>>,
    ) -> Result<Vec<FWPM_FILTER_CONDITION0>, FirewallError> {
        let mut raw = Vec::with_capacity(conditions.len());
        for condition in conditions {
            let (field, match_type, value) = match condition {
                Condition::LocalInterface(adapter) | Condition::OtherInterface(adapter) => {
                    values.luids.push(Box::new(adapter.0));
                    let luid = values.luids.last_mut().map(|b| &mut **b as *mut u64);
                    let match_type = match condition {
                        Condition::OtherInterface(_) => FWP_MATCH_NOT_EQUAL,
                        _ => FWP_MATCH_EQUAL,
                    };
                    (
                        FWPM_CONDITION_IP_LOCAL_INTERFACE,
                        match_type,
                        FWP_CONDITION_VALUE0 {
                            r#type: FWP_UINT64,
                            Anonymous: FWP_CONDITION_VALUE0_0 {
                                uint64: luid.unwrap_or(std::ptr::null_mut()),
                            },
                        },
                    )
                }
                Condition::CurrentProcessImage => (
                    FWPM_CONDITION_ALE_APP_ID,
                    FWP_MATCH_EQUAL,
                    FWP_CONDITION_VALUE0 {
                        r#type: FWP_BYTE_BLOB_TYPE,
                        Anonymous: FWP_CONDITION_VALUE0_0 {
                            byteBlob: self.current_process_app_id()?,
                        },
                    },
                ),
                Condition::CurrentProcessOwner => {
                    let blob = sd_blob.insert(Box::new(self.current_process_sd()?));
                    (
                        FWPM_CONDITION_ALE_USER_ID,
                        FWP_MATCH_EQUAL,
                        FWP_CONDITION_VALUE0 {
                            r#type: FWP_SECURITY_DESCRIPTOR_TYPE,
                            Anonymous: FWP_CONDITION_VALUE0_0 {
                                sd: &mut **blob as *mut FWP_BYTE_BLOB,
                            },
                        },
                    )
                }
                Condition::InterfaceType(if_type) => (
                    FWPM_CONDITION_INTERFACE_TYPE,
                    FWP_MATCH_EQUAL,
                    FWP_CONDITION_VALUE0 {
                        r#type: FWP_UINT32,
                        Anonymous: FWP_CONDITION_VALUE0_0 { uint32: *if_type },
                    },
                ),
                Condition::Protocol(protocol) => (
                    FWPM_CONDITION_IP_PROTOCOL,
                    FWP_MATCH_EQUAL,
                    FWP_CONDITION_VALUE0 {
                        r#type: FWP_UINT8,
                        Anonymous: FWP_CONDITION_VALUE0_0 { uint8: *protocol },
                    },
                ),
                Condition::RemoteAddress(IpAddr::V4(addr)) => (
                    FWPM_CONDITION_IP_REMOTE_ADDRESS,
                    FWP_MATCH_EQUAL,
                    FWP_CONDITION_VALUE0 {
                        r#type: FWP_UINT32,
                        Anonymous: FWP_CONDITION_VALUE0_0 {
                            uint32: u32::from(*addr),
                        },
                    },
                ),
                Condition::RemoteAddress(IpAddr::V6(addr)) => {
                    values.v6_addresses.push(Box::new(FWP_BYTE_ARRAY16 {
                        byteArray16: addr.octets(),
                    }));
                    let ptr = values
                        .v6_addresses
                        .last_mut()
                        .map(|b| &mut **b as *mut FWP_BYTE_ARRAY16)
                        .unwrap_or(std::ptr::null_mut());
                    (
                        FWPM_CONDITION_IP_REMOTE_ADDRESS,
                        FWP_MATCH_EQUAL,
                        FWP_CONDITION_VALUE0 {
                            r#type: FWP_BYTE_ARRAY16_TYPE,
                            Anonymous: FWP_CONDITION_VALUE0_0 { byteArray16: ptr },
                        },
                    )
                }
                Condition::RemoteSubnet(cidr) | Condition::LocalSubnet(cidr) => {
                    let field = match condition {
                        Condition::RemoteSubnet(_) => FWPM_CONDITION_IP_REMOTE_ADDRESS,
                        _ => FWPM_CONDITION_IP_LOCAL_ADDRESS,
                    };
                    let value = match cidr.addr {
                        IpAddr::V4(addr) => {
                            let mask = match cidr.cidr {
                                0 => 0,
                                bits => u32::MAX << (32 - u32::from(bits)),
                            };
                            values.v4_masks.push(Box::new(FWP_V4_ADDR_AND_MASK {
                                addr: u32::from(addr),
                                mask,
                            }));
                            FWP_CONDITION_VALUE0 {
                                r#type: FWP_V4_ADDR_MASK,
                                Anonymous: FWP_CONDITION_VALUE0_0 {
                                    v4AddrMask: values
                                        .v4_masks
                                        .last_mut()
                                        .map(|b| &mut **b as *mut FWP_V4_ADDR_AND_MASK)
                                        .unwrap_or(std::ptr::null_mut()),
                                },
                            }
                        }
                        IpAddr::V6(addr) => {
                            values.v6_masks.push(Box::new(FWP_V6_ADDR_AND_MASK {
                                addr: addr.octets(),
                                prefixLength: cidr.cidr,
                            }));
                            FWP_CONDITION_VALUE0 {
                                r#type: FWP_V6_ADDR_MASK,
                                Anonymous: FWP_CONDITION_VALUE0_0 {
                                    v6AddrMask: values
                                        .v6_masks
                                        .last_mut()
                                        .map(|b| &mut **b as *mut FWP_V6_ADDR_AND_MASK)
                                        .unwrap_or(std::ptr::null_mut()),
                                },
                            }
                        }
                    };
                    (field, FWP_MATCH_EQUAL, value)
                }
                Condition::LocalPort(port) | Condition::IcmpType(port) => (
                    // The ICMP type is carried in the local port field.
                    FWPM_CONDITION_IP_LOCAL_PORT,
                    FWP_MATCH_EQUAL,
                    FWP_CONDITION_VALUE0 {
                        r#type: FWP_UINT16,
                        Anonymous: FWP_CONDITION_VALUE0_0 { uint16: *port },
                    },
                ),
                Condition::RemotePort(port) => (
                    FWPM_CONDITION_IP_REMOTE_PORT,
                    FWP_MATCH_EQUAL,
                    FWP_CONDITION_VALUE0 {
                        r#type: FWP_UINT16,
                        Anonymous: FWP_CONDITION_VALUE0_0 { uint16: *port },
                    },
                ),
                // ALE layers expose no hop limit; the stack itself discards
                // neighbor discovery packets that were forwarded.
                Condition::HopLimit(_) => continue,
            };
            raw.push(FWPM_FILTER_CONDITION0 {
                fieldKey: field,
                matchType: match_type,
                conditionValue: value,
            });
        }
        Ok(raw)
    }

    fn release_process_objects(&mut self) {
        unsafe {
            if !self.app_id.is_null() {
                let mut app_id = self.app_id as *mut std::ffi::c_void;
                FwpmFreeMemory0(&mut app_id);
                self.app_id = std::ptr::null_mut();
            }
            if let Some((sd, _)) = self.process_sd.take() {
                let _ = LocalFree(HLOCAL(sd.0));
            }
        }
    }
}

fn layer_key(layer: Layer) -> GUID {
    match layer {
        Layer::AuthConnectV4 => FWPM_LAYER_ALE_AUTH_CONNECT_V4,
        Layer::AuthRecvAcceptV4 => FWPM_LAYER_ALE_AUTH_RECV_ACCEPT_V4,
        Layer::AuthConnectV6 => FWPM_LAYER_ALE_AUTH_CONNECT_V6,
        Layer::AuthRecvAcceptV6 => FWPM_LAYER_ALE_AUTH_RECV_ACCEPT_V6,
    }
}

impl FilterEngine for WfpEngine {
    fn open_session(&mut self) -> Result<(), FirewallError> {
        if self.handle.is_some() {
            return Err(FirewallError::InvalidState("session already open"));
        }
        let display = DisplayData::new("Tunnel Manager", "Tunnel Manager dynamic session");
        let session = FWPM_SESSION0 {
            displayData: display.raw(),
            flags: FWPM_SESSION_FLAG_DYNAMIC,
            txnWaitTimeoutInMSec: INFINITE,
            ..Default::default()
        };
        let mut handle = HANDLE::default();
        unsafe {
            check(
                "FwpmEngineOpen0",
                FwpmEngineOpen0(None, RPC_C_AUTHN_WINNT, None, Some(&session), &mut handle),
            )?;
        }
        self.handle = Some(handle);
        Ok(())
    }

    fn begin_transaction(&mut self) -> Result<(), FirewallError> {
        let handle = self.handle()?;
        unsafe { check("FwpmTransactionBegin0", FwpmTransactionBegin0(handle, 0)) }
    }

    fn add_provider(&mut self, provider: &Provider) -> Result<(), FirewallError> {
        let handle = self.handle()?;
        let display = DisplayData::new(&provider.name, &provider.description);
        let raw = FWPM_PROVIDER0 {
            providerKey: guid(provider.key),
            displayData: display.raw(),
            ..Default::default()
        };
        unsafe { check("FwpmProviderAdd0", FwpmProviderAdd0(handle, &raw, None)) }
    }

    fn add_sublayer(&mut self, sublayer: &Sublayer) -> Result<(), FirewallError> {
        let handle = self.handle()?;
        let display = DisplayData::new(&sublayer.name, &sublayer.description);
        let mut provider_key = guid(sublayer.provider);
        let raw = FWPM_SUBLAYER0 {
            subLayerKey: guid(sublayer.key),
            displayData: display.raw(),
            providerKey: &mut provider_key,
            weight: sublayer.weight,
            ..Default::default()
        };
        unsafe { check("FwpmSubLayerAdd0", FwpmSubLayerAdd0(handle, &raw, None)) }
    }

    fn add_filter(&mut self, filter: &FilterSpec) -> Result<u64, FirewallError> {
        let handle = self.handle()?;
        let mut values = ConditionValues::default();
        let mut sd_blob = None;
        let mut conditions = self.build_conditions(&filter.conditions, &mut values, &mut sd_blob)?;

        let display = DisplayData::new(&filter.name, "");
        let mut provider_key = guid(crate::firewall::rules::PROVIDER_KEY);
        let raw = FWPM_FILTER0 {
            displayData: display.raw(),
            providerKey: &mut provider_key,
            layerKey: layer_key(filter.layer),
            subLayerKey: guid(filter.sublayer.key()),
            weight: FWP_VALUE0 {
                r#type: FWP_UINT8,
                Anonymous: FWP_VALUE0_0 {
                    uint8: filter.weight.value(),
                },
            },
            numFilterConditions: conditions.len() as u32,
            filterCondition: if conditions.is_empty() {
                std::ptr::null_mut()
            } else {
                conditions.as_mut_ptr()
            },
            action: FWPM_ACTION0 {
                r#type: match filter.action {
                    Action::Permit => FWP_ACTION_PERMIT,
                    Action::Block => FWP_ACTION_BLOCK,
                },
                Anonymous: FWPM_ACTION0_0 {
                    filterType: GUID::zeroed(),
                },
            },
            ..Default::default()
        };

        let mut filter_id = 0u64;
        unsafe {
            check(
                "FwpmFilterAdd0",
                FwpmFilterAdd0(handle, &raw, None, Some(&mut filter_id)),
            )?;
        }
        Ok(filter_id)
    }

    fn commit_transaction(&mut self) -> Result<(), FirewallError> {
        let handle = self.handle()?;
        unsafe { check("FwpmTransactionCommit0", FwpmTransactionCommit0(handle)) }
    }

    fn abort_transaction(&mut self) {
        if let Some(handle) = self.handle {
            unsafe {
                let _ = FwpmTransactionAbort0(handle);
            }
        }
    }

    fn close_session(&mut self) {
        if let Some(handle) = self.handle.take() {
            unsafe {
                let _ = FwpmEngineClose0(handle);
            }
        }
        self.release_process_objects();
    }
}

impl Drop for WfpEngine {
    fn drop(&mut self) {
        self.close_session();
    }
}
