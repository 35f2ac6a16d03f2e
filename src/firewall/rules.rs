//! The filter set installed for one protected adapter, independent of the
//! engine that installs it.

use crate::conf::IpCidr;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use uuid::Uuid;

pub const PROVIDER_KEY: Uuid = Uuid::from_u128(0x6d2f_3a5c_9b41_4e07_8c2a_51f0_e6b9_7d14);
pub const PERMISSIVE_SUBLAYER_KEY: Uuid = Uuid::from_u128(0x1c8e_74b2_05d9_4f3a_a6e1_2b97_c4d0_58f3);
pub const DENY_SUBLAYER_KEY: Uuid = Uuid::from_u128(0xa95b_0e61_3f7c_4b28_9d04_e8c2_71a6_3b5d);

pub const IF_TYPE_SOFTWARE_LOOPBACK: u32 = 24;
pub const IPPROTO_UDP: u8 = 17;
pub const IPPROTO_ICMPV6: u8 = 58;
pub const DNS_PORT: u16 = 53;
pub const NDP_HOP_LIMIT: u8 = 255;

/// Identifies the tunnel adapter to the filter engine (the interface LUID on
/// Windows).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AdapterId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Layer {
    AuthConnectV4,
    AuthRecvAcceptV4,
    AuthConnectV6,
    AuthRecvAcceptV6,
}

impl Layer {
    pub const ALL: [Layer; 4] = [
        Layer::AuthConnectV4,
        Layer::AuthRecvAcceptV4,
        Layer::AuthConnectV6,
        Layer::AuthRecvAcceptV6,
    ];

    pub fn is_outbound(&self) -> bool {
        matches!(self, Layer::AuthConnectV4 | Layer::AuthConnectV6)
    }

    pub fn is_v6(&self) -> bool {
        matches!(self, Layer::AuthConnectV6 | Layer::AuthRecvAcceptV6)
    }

    fn describe(&self) -> &'static str {
        match self {
            Layer::AuthConnectV4 => "outbound IPv4",
            Layer::AuthRecvAcceptV4 => "inbound IPv4",
            Layer::AuthConnectV6 => "outbound IPv6",
            Layer::AuthRecvAcceptV6 => "inbound IPv6",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Permit,
    Block,
}

/// Permits always carry the maximum weight and catch-all blocks the minimum,
/// so permits win ties regardless of insertion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Weight {
    Min,
    Max,
}

impl Weight {
    pub fn value(&self) -> u8 {
        match self {
            Weight::Min => 0,
            Weight::Max => 15,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SublayerKind {
    Permissive,
    Deny,
}

impl SublayerKind {
    pub fn key(&self) -> Uuid {
        match self {
            SublayerKind::Permissive => PERMISSIVE_SUBLAYER_KEY,
            SublayerKind::Deny => DENY_SUBLAYER_KEY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Condition {
    LocalInterface(AdapterId),
    /// Matches every interface except the given one.
    OtherInterface(AdapterId),
    /// The executable image of the installing process.
    CurrentProcessImage,
    /// The security descriptor of the installing process, so that a lower
    /// privileged process running the same image does not match.
    CurrentProcessOwner,
    InterfaceType(u32),
    Protocol(u8),
    /// Repeated remote address conditions are OR-ed by the engine.
    RemoteAddress(IpAddr),
    RemoteSubnet(IpCidr),
    LocalSubnet(IpCidr),
    LocalPort(u16),
    RemotePort(u16),
    IcmpType(u16),
    HopLimit(u8),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Provider {
    pub key: Uuid,
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sublayer {
    pub key: Uuid,
    pub provider: Uuid,
    pub name: String,
    pub description: String,
    pub weight: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterSpec {
    pub name: String,
    pub layer: Layer,
    pub sublayer: SublayerKind,
    pub weight: Weight,
    pub action: Action,
    pub conditions: Vec<Condition>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleSet {
    pub provider: Provider,
    pub sublayers: Vec<Sublayer>,
    pub filters: Vec<FilterSpec>,
}

fn permit(name: impl Into<String>, layer: Layer, conditions: Vec<Condition>) -> FilterSpec {
    FilterSpec {
        name: name.into(),
        layer,
        sublayer: SublayerKind::Permissive,
        weight: Weight::Max,
        action: Action::Permit,
        conditions,
    }
}

fn on_every_layer(
    rules: &mut Vec<FilterSpec>,
    what: &str,
    conditions: Vec<Condition>,
    make: fn(String, Layer, Vec<Condition>) -> FilterSpec,
) {
    for layer in Layer::ALL {
        rules.push(make(
            format!("{} ({})", what, layer.describe()),
            layer,
            conditions.clone(),
        ));
    }
}

fn permit_filter(name: String, layer: Layer, conditions: Vec<Condition>) -> FilterSpec {
    permit(name, layer, conditions)
}

fn link_local() -> IpCidr {
    IpCidr {
        addr: IpAddr::V6(Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 0)),
        cidr: 10,
    }
}

fn permit_dhcp(rules: &mut Vec<FilterSpec>) {
    rules.push(permit(
        "Permit outbound DHCP request (IPv4)",
        Layer::AuthConnectV4,
        vec![
            Condition::Protocol(IPPROTO_UDP),
            Condition::LocalPort(68),
            Condition::RemoteAddress(IpAddr::V4(Ipv4Addr::BROADCAST)),
            Condition::RemotePort(67),
        ],
    ));
    rules.push(permit(
        "Permit inbound DHCP response (IPv4)",
        Layer::AuthRecvAcceptV4,
        vec![
            Condition::Protocol(IPPROTO_UDP),
            Condition::LocalPort(68),
            Condition::RemotePort(67),
        ],
    ));
    rules.push(permit(
        "Permit outbound DHCP request (IPv6)",
        Layer::AuthConnectV6,
        vec![
            Condition::Protocol(IPPROTO_UDP),
            Condition::RemoteAddress(IpAddr::V6(Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 1, 2))),
            Condition::RemoteAddress(IpAddr::V6(Ipv6Addr::new(0xff05, 0, 0, 0, 0, 0, 1, 3))),
            Condition::RemotePort(547),
            Condition::LocalSubnet(link_local()),
            Condition::LocalPort(546),
        ],
    ));
    rules.push(permit(
        "Permit inbound DHCP response (IPv6)",
        Layer::AuthRecvAcceptV6,
        vec![
            Condition::Protocol(IPPROTO_UDP),
            Condition::RemoteSubnet(link_local()),
            Condition::RemotePort(547),
            Condition::LocalSubnet(link_local()),
            Condition::LocalPort(546),
        ],
    ));
}

fn ndp(icmp_type: u16, extra: Option<Condition>) -> Vec<Condition> {
    let mut conditions = vec![
        Condition::Protocol(IPPROTO_ICMPV6),
        Condition::IcmpType(icmp_type),
        Condition::HopLimit(NDP_HOP_LIMIT),
    ];
    conditions.extend(extra);
    conditions
}

fn permit_ndp(rules: &mut Vec<FilterSpec>) {
    let all_routers = Condition::RemoteAddress(IpAddr::V6(Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 2)));
    let from_link_local = Condition::RemoteSubnet(link_local());

    rules.push(permit(
        "Permit outbound router solicitation",
        Layer::AuthConnectV6,
        ndp(133, Some(all_routers)),
    ));
    rules.push(permit(
        "Permit inbound router advertisement",
        Layer::AuthRecvAcceptV6,
        ndp(134, Some(from_link_local.clone())),
    ));
    for (icmp_type, what) in [(135, "neighbor solicitation"), (136, "neighbor advertisement")] {
        rules.push(permit(
            format!("Permit outbound {}", what),
            Layer::AuthConnectV6,
            ndp(icmp_type, None),
        ));
        rules.push(permit(
            format!("Permit inbound {}", what),
            Layer::AuthRecvAcceptV6,
            ndp(icmp_type, None),
        ));
    }
    rules.push(permit(
        "Permit inbound redirect",
        Layer::AuthRecvAcceptV6,
        ndp(137, Some(from_link_local)),
    ));
}

/// Builds the ordered filter set protecting `adapter`.
pub fn build_rule_set(adapter: AdapterId, restrict_dns: bool, restrict_all: bool) -> RuleSet {
    let provider = Provider {
        key: PROVIDER_KEY,
        name: "Tunnel Manager".to_string(),
        description: "Tunnel Manager provider".to_string(),
    };

    let mut sublayers = vec![Sublayer {
        key: PERMISSIVE_SUBLAYER_KEY,
        provider: PROVIDER_KEY,
        name: "Tunnel Manager filters".to_string(),
        description: "Permissive and blocking filters".to_string(),
        weight: u16::MAX,
    }];
    if restrict_dns {
        sublayers.push(Sublayer {
            key: DENY_SUBLAYER_KEY,
            provider: PROVIDER_KEY,
            name: "Tunnel Manager DNS filters".to_string(),
            description: "Block DNS outside the tunnel".to_string(),
            weight: u16::MAX - 1,
        });
    }

    let mut filters = Vec::new();
    on_every_layer(
        &mut filters,
        "Permit traffic on tunnel adapter",
        vec![Condition::LocalInterface(adapter)],
        permit_filter,
    );
    on_every_layer(
        &mut filters,
        "Permit unrestricted traffic for tunnel service",
        vec![Condition::CurrentProcessImage, Condition::CurrentProcessOwner],
        permit_filter,
    );
    on_every_layer(
        &mut filters,
        "Permit loopback traffic",
        vec![Condition::InterfaceType(IF_TYPE_SOFTWARE_LOOPBACK)],
        permit_filter,
    );
    permit_dhcp(&mut filters);
    permit_ndp(&mut filters);

    if restrict_dns {
        on_every_layer(
            &mut filters,
            "Block DNS outside the tunnel",
            vec![
                Condition::RemotePort(DNS_PORT),
                Condition::OtherInterface(adapter),
            ],
            |name, layer, conditions| FilterSpec {
                name,
                layer,
                sublayer: SublayerKind::Deny,
                weight: Weight::Min,
                action: Action::Block,
                conditions,
            },
        );
    }

    if restrict_all {
        on_every_layer(
            &mut filters,
            "Block all unmatched traffic",
            Vec::new(),
            |name, layer, conditions| FilterSpec {
                name,
                layer,
                sublayer: SublayerKind::Permissive,
                weight: Weight::Min,
                action: Action::Block,
                conditions,
            },
        );
    }

    RuleSet {
        provider,
        sublayers,
        filters,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ADAPTER: AdapterId = AdapterId(0x0006_0000_0001_0000);

    #[test]
    fn test_permits_max_blocks_min() {
        let rules = build_rule_set(ADAPTER, true, true);
        for filter in &rules.filters {
            match filter.action {
                Action::Permit => assert_eq!(filter.weight, Weight::Max, "{}", filter.name),
                Action::Block => assert_eq!(filter.weight, Weight::Min, "{}", filter.name),
            }
        }
    }

    #[test]
    fn test_unrestricted_has_no_blocks() {
        let rules = build_rule_set(ADAPTER, false, false);
        assert!(rules.filters.iter().all(|f| f.action == Action::Permit));
        assert_eq!(rules.sublayers.len(), 1);
    }

    #[test]
    fn test_dns_block_lives_in_deny_sublayer() {
        let rules = build_rule_set(ADAPTER, true, false);
        let dns: Vec<_> = rules
            .filters
            .iter()
            .filter(|f| f.conditions.contains(&Condition::RemotePort(DNS_PORT)))
            .collect();
        assert_eq!(dns.len(), 4);
        for filter in dns {
            assert_eq!(filter.sublayer, SublayerKind::Deny);
            assert!(filter.conditions.contains(&Condition::OtherInterface(ADAPTER)));
        }
        assert!(rules.sublayers.iter().any(|s| s.key == DENY_SUBLAYER_KEY));
        let deny = rules.sublayers.iter().find(|s| s.key == DENY_SUBLAYER_KEY).unwrap();
        assert!(deny.weight < rules.sublayers[0].weight);
    }

    #[test]
    fn test_block_all_is_last_on_every_layer() {
        let rules = build_rule_set(ADAPTER, false, true);
        let tail = &rules.filters[rules.filters.len() - 4..];
        assert!(tail.iter().all(|f| f.action == Action::Block && f.conditions.is_empty()));
        let layers: Vec<_> = tail.iter().map(|f| f.layer).collect();
        assert_eq!(layers, Layer::ALL.to_vec());
    }

    #[test]
    fn test_ndp_rules_complete() {
        let rules = build_rule_set(ADAPTER, false, true);
        let icmp = |f: &FilterSpec| {
            f.conditions.iter().find_map(|c| match c {
                Condition::IcmpType(t) => Some(*t),
                _ => None,
            })
        };
        let ndp: Vec<_> = rules.filters.iter().filter_map(|f| icmp(f).map(|t| (t, f))).collect();

        let directions = |t: u16| -> Vec<bool> {
            ndp.iter()
                .filter(|(ty, _)| *ty == t)
                .map(|(_, f)| f.layer.is_outbound())
                .collect()
        };
        assert_eq!(directions(133), vec![true]);
        assert_eq!(directions(134), vec![false]);
        assert_eq!(directions(135), vec![true, false]);
        assert_eq!(directions(136), vec![true, false]);
        assert_eq!(directions(137), vec![false]);

        for (_, filter) in &ndp {
            assert!(filter.layer.is_v6());
            assert!(filter.conditions.contains(&Condition::HopLimit(255)));
            assert!(filter.conditions.contains(&Condition::Protocol(IPPROTO_ICMPV6)));
        }
    }

    #[test]
    fn test_adapter_rules_come_first() {
        let rules = build_rule_set(ADAPTER, true, true);
        for filter in &rules.filters[..4] {
            assert_eq!(filter.conditions, vec![Condition::LocalInterface(ADAPTER)]);
        }
    }
}
