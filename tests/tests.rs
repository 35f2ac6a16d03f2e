use std::collections::BTreeMap;
use std::path::PathBuf;
use tunnel_manager::conf::{
    ConfigStore, Endpoint, Interface, Key, ManagerSettings, Peer, TunnelConfig, TunnelName,
    load_settings, natural_cmp,
};
use tunnel_manager::manager::TunnelState;
use tunnel_manager::manager::types::global_state;

fn test_dir() -> PathBuf {
    std::env::temp_dir().join(format!("tunnel_manager_test_{}", uuid::Uuid::new_v4()))
}

fn config(name: &str) -> TunnelConfig {
    TunnelConfig {
        name: TunnelName::new(name).unwrap(),
        interface: Interface {
            private_key: Key::from_bytes([3u8; 32]),
            addresses: vec!["10.8.0.2/24".parse().unwrap()],
            listen_port: None,
            mtu: Some(1420),
            dns: vec!["10.8.0.1".parse().unwrap()],
            pre_up: None,
            post_up: None,
            pre_down: None,
            post_down: None,
        },
        peers: vec![Peer {
            public_key: Key::from_bytes([4u8; 32]),
            preshared_key: None,
            allowed_ips: vec!["10.8.0.0/24".parse().unwrap()],
            endpoint: Some("203.0.113.7:51820".parse::<Endpoint>().unwrap()),
            persistent_keepalive: None,
            stats: None,
        }],
    }
}

mod tunnel_names {
    use super::*;
    use tunnel_manager::services::{pipe_path_of_tunnel, service_name_of_tunnel};

    #[test]
    fn accepted_names() {
        for name in ["office", "corp-vpn", "a.b_c+d=e", "x"] {
            assert!(TunnelName::new(name).is_ok(), "{} should be valid", name);
        }
    }

    #[test]
    fn rejected_names() {
        let too_long = "a".repeat(33);
        for name in ["", "con", "LPT1", "has space", "dollar$", "a/b", too_long.as_str()] {
            assert!(TunnelName::new(name).is_err(), "{:?} should be invalid", name);
        }
    }

    #[test]
    fn service_and_pipe_names() {
        assert_eq!(
            service_name_of_tunnel("office").unwrap(),
            "TunnelManagerTunnel$office"
        );
        assert!(service_name_of_tunnel("bad name").is_err());

        let pipe = pipe_path_of_tunnel("office").unwrap();
        assert!(pipe.to_string_lossy().ends_with("office"));
        assert!(pipe_path_of_tunnel("nul").is_err());
    }

    #[test]
    fn natural_order() {
        let mut names = vec!["tunnel10", "tunnel2", "Alpha", "tunnel1"];
        names.sort_by(|a, b| natural_cmp(a, b));
        assert_eq!(names, vec!["Alpha", "tunnel1", "tunnel2", "tunnel10"]);
    }
}

mod tunnel_store {
    use super::*;

    #[tokio::test]
    async fn save_list_delete() {
        let dir = test_dir();
        let store = ConfigStore::new(dir.join("tunnels"));

        store.save(&config("tunnel10")).await.unwrap();
        store.save(&config("tunnel2")).await.unwrap();
        std::fs::write(dir.join("tunnels").join("notes.txt"), "ignored").unwrap();

        let names: Vec<String> = store
            .list_config_names()
            .await
            .unwrap()
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(names, vec!["tunnel2", "tunnel10"]);

        let loaded = store.load(&TunnelName::new("tunnel2").unwrap()).await.unwrap();
        assert_eq!(loaded, config("tunnel2"));

        store.delete(&TunnelName::new("tunnel2").unwrap()).await.unwrap();
        assert!(!store.exists(&TunnelName::new("tunnel2").unwrap()).await);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn invalid_config_rejected() {
        let mut zero_key = config("office");
        zero_key.interface.private_key = Key::from_bytes([0u8; 32]);
        assert!(zero_key.validate().is_err());

        let mut duplicate_peer = config("office");
        duplicate_peer.peers.push(duplicate_peer.peers[0].clone());
        assert!(duplicate_peer.validate().is_err());
    }
}

mod settings {
    use super::*;

    #[tokio::test]
    async fn missing_file_writes_defaults() {
        let dir = test_dir();
        let path = dir.join("tunnel_manager.yaml");

        let settings = load_settings(&path).await.unwrap();
        assert_eq!(settings, ManagerSettings::default());
        assert!(path.exists());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn corrupted_file_is_backed_up() {
        let dir = test_dir();
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("tunnel_manager.yaml");
        std::fs::write(&path, "version: [unterminated").unwrap();

        let err = load_settings(&path).await.unwrap_err();
        assert!(err.to_string().contains("corrupted"));
        assert!(path.with_extension("yaml.bak").exists());
        assert_eq!(load_settings(&path).await.unwrap(), ManagerSettings::default());

        let _ = std::fs::remove_dir_all(&dir);
    }
}

mod tunnel_state {
    use super::*;

    #[test]
    fn global_state_precedence() {
        use TunnelState::*;
        assert_eq!(global_state([Started, Stopping, Stopped]), Stopping);
        assert_eq!(global_state([Started, Starting]), Starting);
        assert_eq!(global_state([Stopped, Unknown]), Started);
        assert_eq!(global_state([Stopped, Stopped]), Stopped);
        assert_eq!(global_state(std::iter::empty()), Stopped);
    }
}

mod versions {
    use super::*;
    use tunnel_manager::updater::version::{find_candidate, version_newer_than};

    #[test]
    fn comparisons() {
        assert!(version_newer_than("1.2.10", "1.2.9").unwrap());
        assert!(!version_newer_than("1.2", "1.2.0").unwrap());
        assert!(!version_newer_than("0.9", "1.0").unwrap());
        assert!(version_newer_than("1..2", "1.0").is_err());
        assert!(version_newer_than("1.x", "1.0").is_err());
    }

    #[test]
    fn newest_matching_artifact() {
        let mut files = BTreeMap::new();
        files.insert("tunnel-manager-amd64-1.1.0.msi".to_string(), [1u8; 32]);
        files.insert("tunnel-manager-amd64-1.3.0.msi".to_string(), [3u8; 32]);
        files.insert("tunnel-manager-arm64-9.0.0.msi".to_string(), [9u8; 32]);
        files.insert("tunnel-manager-amd64-2.0.0.zip".to_string(), [2u8; 32]);

        let found = find_candidate(&files, "tunnel-manager-", "amd64", ".msi", "1.0.0")
            .unwrap()
            .unwrap();
        assert_eq!(found.name, "tunnel-manager-amd64-1.3.0.msi");
        assert_eq!(found.hash, [3u8; 32]);

        assert!(
            find_candidate(&files, "tunnel-manager-", "amd64", ".msi", "1.3.0")
                .unwrap()
                .is_none()
        );
    }
}

mod firewall {
    use tunnel_manager::firewall::{AdapterId, Firewall, FirewallError, MemoryEngine};

    #[test]
    fn enable_is_all_or_nothing() {
        let mut firewall = Firewall::new(MemoryEngine::failing_at_filter(3));
        assert!(firewall.enable(AdapterId(7), true, true).is_err());
        assert!(!firewall.is_enabled());
        assert!(firewall.engine().filters().is_empty());
        assert!(!firewall.engine().session_open());
    }

    #[test]
    fn second_enable_refused() {
        let mut firewall = Firewall::new(MemoryEngine::default());
        firewall.enable(AdapterId(7), true, false).unwrap();
        let installed = firewall.engine().filters().len();
        assert!(installed > 0);

        assert!(matches!(
            firewall.enable(AdapterId(7), true, false),
            Err(FirewallError::AlreadyEnabled)
        ));
        assert_eq!(firewall.engine().filters().len(), installed);

        firewall.disable();
        assert!(!firewall.engine().session_open());
    }
}
