//! Typed builders for the NAT rules installed on hypervisor hosts.

use crate::models::Protocol;

pub const RULES_V4: &str = "/etc/iptables/rules.v4";

/// A DNAT forward from a host port to a guest address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Forward<'a> {
    /// Restrict to packets arriving on this interface (`vmbr0` on Proxmox).
    pub interface: Option<&'a str>,
    pub protocol: Protocol,
    pub host_port: u16,
    pub dest_ip: &'a str,
    pub guest_port: u16,
}

impl Forward<'_> {
    fn rule(&self, transport: &str) -> String {
        let iface = self
            .interface
            .map(|i| format!("-i {i} "))
            .unwrap_or_default();
        format!(
            "PREROUTING {iface}-p {transport} --dport {} -j DNAT --to-destination {}:{}",
            self.host_port, self.dest_ip, self.guest_port
        )
    }

    /// Commands installing the forward, skipping rules that already exist.
    pub fn add_commands(&self) -> Vec<String> {
        self.protocol
            .transports()
            .iter()
            .flat_map(|t| {
                let rule = self.rule(t);
                let forward = format!(
                    "FORWARD -p {t} -d {} --dport {} -j ACCEPT",
                    self.dest_ip, self.guest_port
                );
                [
                    format!("iptables -t nat -C {rule} 2>/dev/null || iptables -t nat -A {rule}"),
                    format!("iptables -C {forward} 2>/dev/null || iptables -I {forward}"),
                ]
            })
            .collect()
    }

    /// Commands removing the forward. Missing rules are ignored.
    pub fn delete_commands(&self) -> Vec<String> {
        self.protocol
            .transports()
            .iter()
            .flat_map(|t| {
                let rule = self.rule(t);
                let forward = format!(
                    "FORWARD -p {t} -d {} --dport {} -j ACCEPT",
                    self.dest_ip, self.guest_port
                );
                [
                    format!("iptables -t nat -D {rule} 2>/dev/null || true"),
                    format!("iptables -D {forward} 2>/dev/null || true"),
                ]
            })
            .collect()
    }
}

/// Source NAT for an instance, installed at most once.
pub fn masquerade(private_ip: &str) -> String {
    let rule = format!("POSTROUTING -s {private_ip} -j MASQUERADE");
    format!("iptables -t nat -C {rule} 2>/dev/null || iptables -t nat -A {rule}")
}

pub fn save() -> String {
    format!("mkdir -p /etc/iptables && iptables-save > {RULES_V4}")
}

/// Delete live NAT rules pointing at `ip`, including its masquerade.
pub fn flush_ip(ip: &str) -> String {
    format!(
        "iptables-save -t nat | grep -F -- '{ip}:' | grep '^-A' | sed 's/^-A //' | \
         while read -r rule; do eval iptables -t nat -D $rule 2>/dev/null || true; done; \
         iptables -t nat -D POSTROUTING -s {ip} -j MASQUERADE 2>/dev/null || true"
    )
}

/// Drop every persisted rule mentioning `ip` and reload the rule set.
pub fn purge_ip(ip: &str) -> String {
    let escaped = ip.replace('.', "\\.");
    format!(
        "if [ -f {RULES_V4} ]; then sed -i '/{escaped}[^0-9]/d;/{escaped}$/d' {RULES_V4} && \
         iptables-restore < {RULES_V4}; fi"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_renders_per_transport() {
        let fwd = Forward {
            interface: Some("vmbr0"),
            protocol: Protocol::Both,
            host_port: 20001,
            dest_ip: "172.16.1.101",
            guest_port: 22,
        };
        let cmds = fwd.add_commands();
        assert_eq!(cmds.len(), 4);
        assert!(cmds[0].contains(
            "iptables -t nat -A PREROUTING -i vmbr0 -p tcp --dport 20001 -j DNAT --to-destination 172.16.1.101:22"
        ));
        assert!(cmds[2].contains("-p udp --dport 20001"));
        assert!(fwd.delete_commands()[0].starts_with("iptables -t nat -D PREROUTING -i vmbr0 -p tcp"));
    }

    #[test]
    fn test_masquerade_is_idempotent() {
        let cmd = masquerade("172.16.1.101");
        assert!(cmd.contains("-C POSTROUTING -s 172.16.1.101 -j MASQUERADE"));
        assert!(cmd.contains("|| iptables -t nat -A POSTROUTING"));
    }

    #[test]
    fn test_flush_targets_destination_and_masquerade() {
        let cmd = flush_ip("172.16.1.7");
        assert!(cmd.contains("grep -F -- '172.16.1.7:'"));
        assert!(cmd.contains("-D POSTROUTING -s 172.16.1.7 -j MASQUERADE"));
    }

    #[test]
    fn test_purge_escapes_dots() {
        assert!(purge_ip("172.16.1.5").contains(r"172\.16\.1\.5[^0-9]"));
    }
}
