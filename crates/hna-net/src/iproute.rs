use anyhow::Result;
use serde::Deserialize;

use hna_core::errors::Error;

use crate::exec::exec;

/// One link as reported by `ip --json --brief link show`.
#[derive(Debug, Clone, Deserialize)]
pub struct Iface {
    #[serde(rename = "ifname")]
    pub name: String,
    #[serde(rename = "operstate", default)]
    pub state: String,
}

/// One neighbor-table entry as reported by `ip --json neigh show`.
#[derive(Debug, Clone, Deserialize)]
pub struct Neighbor {
    #[serde(rename = "dst")]
    pub address: String,
    #[serde(rename = "lladdr", default)]
    pub mac: String,
    #[serde(rename = "dev", default)]
    pub dev: String,
}

fn scoped(namespace: Option<&str>, tail: &[&str]) -> Vec<String> {
    let mut argv: Vec<String> = Vec::new();
    if let Some(ns) = namespace {
        argv.extend(["ip", "netns", "exec", ns].map(String::from));
    }
    argv.extend(tail.iter().map(|s| s.to_string()));
    argv
}

/// All links, optionally inside a namespace.
pub fn iface_get_all(namespace: Option<&str>) -> Result<Vec<Iface>> {
    let argv = scoped(namespace, &["ip", "--json", "--brief", "link", "show"]);
    let output = exec(&[], &argv)?;

    let ifaces: Vec<Iface> = serde_json::from_str(output.trim())
        .map_err(|e| Error::Parse(format!("iproute: Failed to parse ifaces: {}", e)))?;
    Ok(ifaces)
}

/// Member ports of a bridge. Tolerates a missing bridge.
pub fn iface_get_bridge_ifaces(namespace: Option<&str>, bridge: &str) -> Result<Vec<Iface>> {
    let argv = scoped(
        namespace,
        &["ip", "--json", "--brief", "link", "show", "master", bridge],
    );
    let output = exec(&["does not exist"], &argv)?;

    if output.trim().is_empty() {
        return Ok(vec![]);
    }

    let ifaces: Vec<Iface> = serde_json::from_str(output.trim())
        .map_err(|e| Error::Parse(format!("iproute: Failed to parse bridge ifaces: {}", e)))?;
    Ok(ifaces)
}

/// Neighbor table of a namespace.
pub fn neighbor_get_all(namespace: &str) -> Result<Vec<Neighbor>> {
    let argv = scoped(Some(namespace), &["ip", "--json", "neigh", "show"]);
    let output = exec(&["Cannot open network namespace"], &argv)?;

    if output.trim().is_empty() || output.contains("Cannot open network namespace") {
        return Ok(vec![]);
    }

    let neighbors: Vec<Neighbor> = serde_json::from_str(output.trim())
        .map_err(|e| Error::Parse(format!("iproute: Failed to parse neighbors: {}", e)))?;
    Ok(neighbors)
}

/// Names of all network namespaces on the host.
pub fn namespace_get_all() -> Result<Vec<String>> {
    let output = exec(&[], &["ip", "netns", "list"])?;

    let mut names: Vec<String> = output
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .map(String::from)
        .collect();
    names.sort();
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::mock;

    #[test]
    fn test_iface_parse() {
        let _guard = mock::install(|argv| {
            assert_eq!(argv[0], "ip");
            mock::MockResponse::ok(
                r#"[{"ifname":"eth0","operstate":"UP"},{"ifname":"p3f7b2c1a","operstate":"UNKNOWN"}]"#,
            )
        });

        let ifaces = iface_get_all(None).unwrap();
        assert_eq!(ifaces.len(), 2);
        assert_eq!(ifaces[0].name, "eth0");
        assert_eq!(ifaces[1].state, "UNKNOWN");
    }

    #[test]
    fn test_iface_namespace_scoped() {
        let _guard = mock::install(|argv| {
            assert_eq!(&argv[..4], &["ip", "netns", "exec", "n3f7b2c1a"]);
            mock::MockResponse::ok("[]")
        });

        let ifaces = iface_get_all(Some("n3f7b2c1a")).unwrap();
        assert!(ifaces.is_empty());
    }

    #[test]
    fn test_bridge_missing_tolerated() {
        let _guard =
            mock::install(|_| mock::MockResponse::fail(1, "Cannot find device, does not exist"));
        let ifaces = iface_get_bridge_ifaces(None, "br0").unwrap();
        assert!(ifaces.is_empty());
    }

    #[test]
    fn test_namespace_list() {
        let _guard = mock::install(|_| {
            mock::MockResponse::ok("n3f7b2c1a (id: 0)\nn9c2d4e5f (id: 1)\n")
        });
        let namespaces = namespace_get_all().unwrap();
        assert_eq!(namespaces, vec!["n3f7b2c1a", "n9c2d4e5f"]);
    }

    #[test]
    fn test_neighbor_parse() {
        let _guard = mock::install(|_| {
            mock::MockResponse::ok(
                r#"[{"dst":"10.97.1.5","lladdr":"02:aa:bb:cc:00:00","dev":"br0","state":["PERMANENT"]}]"#,
            )
        });
        let neighbors = neighbor_get_all("n3f7b2c1a").unwrap();
        assert_eq!(neighbors.len(), 1);
        assert_eq!(neighbors[0].address, "10.97.1.5");
        assert_eq!(neighbors[0].mac, "02:aa:bb:cc:00:00");
    }
}
