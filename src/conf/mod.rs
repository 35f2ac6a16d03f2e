pub mod config;
pub mod name;
pub mod settings;
pub mod store;

pub use config::{Endpoint, Interface, IpCidr, Key, Peer, PeerStats, TunnelConfig};
pub use name::{NameError, TunnelName, natural_cmp, tunnel_name_is_less, tunnel_name_is_valid};
pub use settings::{ManagerSettings, load_settings, save_settings};
pub use store::{ConfigStore, StoreWatcher, write_atomic};
