//! Remote command sequences

use k3sd_common::{NodeSpec, K3S_API_PORT};
use k3sd_remote::{relay, split_host_port, url_host};

/// Where k3s writes the admin kubeconfig on the control-plane node
pub const KUBECONFIG_PATH: &str = "/etc/rancher/k3s/k3s.yaml";

/// Script printing a fresh join token
pub const TOKEN_SCRIPT: &str = "echo $(k3s token create)";

/// Script printing the admin kubeconfig
pub fn kubeconfig_script() -> String {
    format!("cat {}", KUBECONFIG_PATH)
}

/// Uninstall script shipped with k3s server installs
pub const SERVER_UNINSTALL: &str = "k3s-uninstall.sh";

/// Uninstall script shipped with k3s agent installs
pub const AGENT_UNINSTALL: &str = "k3s-agent-uninstall.sh";

/// Control-plane bootstrap: prerequisites, k3s server without traefik,
/// a settle delay, then any operator-supplied commands.
pub fn bootstrap_commands(node_name: &str, settle_secs: u64, extra: &[String]) -> Vec<String> {
    let mut commands = vec![
        "sudo apt-get update -y".to_string(),
        "sudo apt-get install curl wget zip unzip -y".to_string(),
        format!(
            "curl -sfL https://get.k3s.io | INSTALL_K3S_EXEC='--disable traefik --node-name {}' K3S_KUBECONFIG_MODE=\"644\" sh -",
            node_name
        ),
        format!("sleep {}", settle_secs),
    ];
    commands.extend(extra.iter().cloned());
    commands
}

/// Commands joining `worker` to the control plane at `master_address`
pub fn join_commands(master_address: &str, token: &str, worker: &NodeSpec) -> Vec<String> {
    let master_host = split_host_port(master_address)
        .map(|(host, _)| host)
        .unwrap_or_else(|_| master_address.to_string());
    vec![
        "sudo apt update && sudo apt install -y curl".to_string(),
        format!(
            "curl -sfL https://get.k3s.io | K3S_URL=https://{}:{} K3S_TOKEN='{}' INSTALL_K3S_EXEC='--node-name {}' sh -",
            url_host(&master_host),
            K3S_API_PORT,
            token.trim(),
            worker.node_name
        ),
    ]
}

/// Join commands wrapped to run on the control-plane node against `worker`
pub fn relayed_join_commands(master_address: &str, token: &str, worker: &NodeSpec) -> Vec<String> {
    join_commands(master_address, token, worker)
        .iter()
        .map(|cmd| relay(worker, cmd))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn worker() -> NodeSpec {
        NodeSpec {
            address: "10.0.0.2".to_string(),
            user: "root".to_string(),
            node_name: "worker-1".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn bootstrap_disables_traefik_and_appends_extras() {
        let cmds = bootstrap_commands("master-1", 10, &["echo done".to_string()]);
        assert_eq!(cmds.len(), 5);
        assert!(cmds[2].contains("--disable traefik --node-name master-1"));
        assert_eq!(cmds[3], "sleep 10");
        assert_eq!(cmds[4], "echo done");
    }

    #[test]
    fn join_targets_api_port_with_trimmed_token() {
        let cmds = join_commands("203.0.113.10:2222", "K10abc::server:xyz\n", &worker());
        assert_eq!(
            cmds[1],
            "curl -sfL https://get.k3s.io | K3S_URL=https://203.0.113.10:6443 K3S_TOKEN='K10abc::server:xyz' INSTALL_K3S_EXEC='--node-name worker-1' sh -"
        );
    }

    #[rstest]
    #[case("203.0.113.10", "https://203.0.113.10:6443")]
    #[case("203.0.113.10:2222", "https://203.0.113.10:6443")]
    #[case("master.example.com", "https://master.example.com:6443")]
    #[case("[fd00::1]:2222", "https://[fd00::1]:6443")]
    #[case("fd00::1", "https://[fd00::1]:6443")]
    fn join_url_uses_master_host(#[case] address: &str, #[case] url: &str) {
        let cmds = join_commands(address, "tok", &worker());
        assert!(cmds[1].contains(&format!("K3S_URL={} ", url)));
    }

    #[test]
    fn relayed_join_goes_through_ssh() {
        let cmds = relayed_join_commands("203.0.113.10", "tok", &worker());
        assert!(cmds.iter().all(|c| c.starts_with("ssh root@10.0.0.2 '")));
    }
}
