//! Stable node identity for the local machine.

use std::path::Path;
use tracing::debug;
use uuid::Uuid;

const NET_CLASS_DIR: &str = "/sys/class/net";
const EMPTY_MAC: &str = "00:00:00:00:00:00";

/// Node id derived from the first hardware address, the working directory and the command line.
///
/// Running the same command from the same directory on the same machine yields the same id.
pub fn machine_node_id() -> Uuid {
    let mac = first_mac_address(Path::new(NET_CLASS_DIR)).unwrap_or_else(|| EMPTY_MAC.to_string());
    let cwd = std::env::current_dir()
        .map(|dir| dir.display().to_string())
        .unwrap_or_default();
    let args = std::env::args().collect::<Vec<_>>().join(" ");
    debug!(%mac, %cwd, "deriving node id");
    derive_node_id(&mac, &cwd, &args)
}

pub fn derive_node_id(mac: &str, cwd: &str, args: &str) -> Uuid {
    let seed = format!("{mac}{cwd}{args}");
    Uuid::new_v5(&Uuid::nil(), seed.as_bytes())
}

/// First non-zero interface address, interfaces taken in name order.
fn first_mac_address(net_class: &Path) -> Option<String> {
    let mut interfaces: Vec<_> = std::fs::read_dir(net_class)
        .ok()?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .collect();
    interfaces.sort();

    interfaces.iter().find_map(|interface| {
        let mac = std::fs::read_to_string(interface.join("address")).ok()?;
        let mac = mac.trim().to_lowercase();
        (!mac.is_empty() && mac != EMPTY_MAC).then_some(mac)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derivation_is_stable() {
        let a = derive_node_id("02:42:ac:11:00:02", "/srv/drill", "drill drill.toml");
        let b = derive_node_id("02:42:ac:11:00:02", "/srv/drill", "drill drill.toml");
        assert_eq!(a, b);
        assert_eq!(a.get_version_num(), 5);
    }

    #[test]
    fn every_input_matters() {
        let base = derive_node_id("02:42:ac:11:00:02", "/srv/drill", "drill");
        assert_ne!(base, derive_node_id("02:42:ac:11:00:03", "/srv/drill", "drill"));
        assert_ne!(base, derive_node_id("02:42:ac:11:00:02", "/srv/other", "drill"));
        assert_ne!(base, derive_node_id("02:42:ac:11:00:02", "/srv/drill", "drill b.toml"));
    }

    #[test]
    fn machine_id_is_repeatable() {
        assert_eq!(machine_node_id(), machine_node_id());
    }

    #[test]
    fn skips_zero_addresses() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        for (name, mac) in [("lo", EMPTY_MAC), ("eth0", "02:42:AC:11:00:02\n")] {
            std::fs::create_dir_all(root.join(name)).unwrap();
            std::fs::write(root.join(name).join("address"), mac).unwrap();
        }

        assert_eq!(
            first_mac_address(root).as_deref(),
            Some("02:42:ac:11:00:02")
        );
    }

    #[test]
    fn missing_directory_has_no_address() {
        assert_eq!(first_mac_address(Path::new("/nonexistent/net")), None);
    }
}
