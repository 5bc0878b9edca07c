use std::thread;
use std::time::Duration;

use anyhow::Result;
use tracing::{error, warn};

use crate::exec::{exec, TABLE_LOCK};

use super::rules::{
    NatTarget, Rules, COMMENT_NAT, COMMENT_ORACLE_NAT, HOST_NAMESPACE,
};

const RETRY_ATTEMPTS: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_millis(250);

fn iptables_cmd(ipv6: bool) -> &'static str {
    if ipv6 {
        "ip6tables"
    } else {
        "iptables"
    }
}

impl Rules {
    fn run(&self, table: Option<&str>, cmds: &[Vec<String>], op: &str, ipv6: bool) -> Result<()> {
        let host = self.namespace == HOST_NAMESPACE;

        for cmd in cmds {
            let mut argv: Vec<String> = Vec::new();
            if host {
                argv.push(iptables_cmd(ipv6).to_string());
            } else {
                argv.extend(
                    ["ip", "netns", "exec", self.namespace.as_str(), iptables_cmd(ipv6)]
                        .map(String::from),
                );
            }
            if let Some(table) = table {
                argv.extend(["-t".to_string(), table.to_string()]);
            }
            argv.push(op.to_string());
            argv.extend(cmd.iter().cloned());

            let mut tolerated = vec!["matching rule exist"];
            if !host {
                tolerated.push("Cannot open network namespace");
            }
            if op == "-D" {
                tolerated.push("match by that name");
            }

            let mut result = Ok(String::new());
            for attempt in 1..=RETRY_ATTEMPTS {
                result = if host {
                    // Host tables are global kernel state.
                    let _guard = TABLE_LOCK.lock();
                    exec(&tolerated, &argv)
                } else {
                    exec(&tolerated, &argv)
                };

                if result.is_ok() {
                    break;
                }
                if attempt < RETRY_ATTEMPTS {
                    thread::sleep(RETRY_DELAY);
                }
            }

            if let Err(err) = result {
                if cmd.last().map(String::as_str) == Some("ACCEPT") {
                    error!(
                        ipv6,
                        command = %argv.join(" "),
                        error = %err,
                        "iptables: Ignoring invalid iptables command",
                    );
                } else {
                    warn!(
                        ipv6,
                        command = %argv.join(" "),
                        error = %err,
                        "iptables: Failed to run iptables command",
                    );
                    return Err(err);
                }
            }
        }

        Ok(())
    }

    /// Install the transient hold drops at the head of the affected
    /// chains before (re)building policy.
    pub fn hold(&mut self) -> Result<()> {
        let cmd = self.hold_command()?;
        self.holds.push(cmd.clone());
        self.holds6.push(cmd);

        let holds = self.holds.clone();
        self.run(None, &holds, "-A", false)?;
        let holds6 = self.holds6.clone();
        self.run(None, &holds6, "-A", true)?;

        Ok(())
    }

    /// Apply the full ordered rule state: SourceDestCheck, Ingress,
    /// Maps, then hold removal last so no packet traverses a
    /// partially-built policy.
    pub fn apply(&mut self) -> Result<()> {
        self.run(None, &self.source_dest_check.clone(), "-A", false)?;
        self.run(None, &self.source_dest_check6.clone(), "-A", true)?;

        self.run(None, &self.ingress.clone(), "-A", false)?;
        self.run(None, &self.ingress6.clone(), "-A", true)?;

        self.run(Some("nat"), &self.maps.clone(), "-A", false)?;
        self.run(Some("nat"), &self.maps6.clone(), "-A", true)?;

        self.run(None, &self.holds.clone(), "-D", false)?;
        self.holds = vec![];

        self.run(None, &self.holds6.clone(), "-D", true)?;
        self.holds6 = vec![];

        Ok(())
    }

    /// Remove every synthesized rule, leaving no marked command in
    /// the affected chains.
    pub fn remove(&mut self) -> Result<()> {
        self.run(None, &self.source_dest_check.clone(), "-D", false)?;
        self.source_dest_check = vec![];

        self.run(None, &self.source_dest_check6.clone(), "-D", true)?;
        self.source_dest_check6 = vec![];

        self.run(None, &self.ingress.clone(), "-D", false)?;
        self.ingress = vec![];

        self.run(None, &self.ingress6.clone(), "-D", true)?;
        self.ingress6 = vec![];

        self.run(Some("nat"), &self.maps.clone(), "-D", false)?;
        self.maps = vec![];

        self.run(Some("nat"), &self.maps6.clone(), "-D", true)?;
        self.maps6 = vec![];

        self.run(None, &self.holds.clone(), "-D", false)?;
        self.holds = vec![];

        self.run(None, &self.holds6.clone(), "-D", true)?;
        self.holds6 = vec![];

        Ok(())
    }

    fn nat_commands(
        &self,
        target: &NatTarget,
        prefix: &str,
        marker: &str,
        ipv6: bool,
    ) -> Vec<Vec<String>> {
        let ipt = iptables_cmd(ipv6);
        let base = vec![
            "ip".to_string(),
            "netns".to_string(),
            "exec".to_string(),
            self.namespace.clone(),
            ipt.to_string(),
            "-t".to_string(),
            "nat".to_string(),
        ];

        let pub_cidr = format!("{}/{}", target.pub_addr, prefix);
        let addr_cidr = format!("{}/{}", target.addr, prefix);

        let dnat = {
            let mut cmd = base.clone();
            cmd.extend(
                [
                    "PREROUTING",
                    "-d",
                    pub_cidr.as_str(),
                    "-m",
                    "comment",
                    "--comment",
                    marker,
                    "-j",
                    "DNAT",
                    "--to-destination",
                    target.addr.as_str(),
                ]
                .map(String::from),
            );
            cmd
        };

        let snat = {
            let mut cmd = base.clone();
            cmd.extend(
                [
                    "POSTROUTING",
                    "-s",
                    addr_cidr.as_str(),
                    "-d",
                    addr_cidr.as_str(),
                    "-m",
                    "comment",
                    "--comment",
                    marker,
                    "-j",
                    "SNAT",
                    "--to",
                    target.pub_addr.as_str(),
                ]
                .map(String::from),
            );
            cmd
        };

        let masquerade = {
            let mut cmd = base;
            cmd.extend(
                [
                    "POSTROUTING",
                    "-s",
                    addr_cidr.as_str(),
                    "-o",
                    self.interface.as_str(),
                    "-m",
                    "comment",
                    "--comment",
                    marker,
                    "-j",
                    "MASQUERADE",
                ]
                .map(String::from),
            );
            cmd
        };

        vec![dnat, snat, masquerade]
    }

    fn run_nat(&self, cmds: Vec<Vec<String>>, op: &str) -> Result<()> {
        let tolerated: &[&str] = if op == "-D" {
            &["matching rule exist", "match by that name"]
        } else {
            &["matching rule exist"]
        };

        for mut cmd in cmds {
            // The operation slots in after `-t nat`.
            cmd.insert(7, op.to_string());
            exec(tolerated, &cmd)?;
        }

        Ok(())
    }

    /// Install the DNAT/SNAT/MASQUERADE triplet for each configured
    /// NAT flavor. Idempotent.
    pub fn apply_nat(&self) -> Result<()> {
        if let Some(target) = &self.nat {
            self.run_nat(self.nat_commands(target, "32", COMMENT_NAT, false), "-A")?;
        }

        if let Some(target) = &self.nat6 {
            self.run_nat(self.nat_commands(target, "128", COMMENT_NAT, true), "-A")?;
        }

        if let Some(target) = &self.oracle_nat {
            self.run_nat(
                self.nat_commands(target, "32", COMMENT_ORACLE_NAT, false),
                "-A",
            )?;
        }

        Ok(())
    }

    /// Remove the NAT triplets. Missing rules are tolerated.
    pub fn remove_nat(&self) -> Result<()> {
        if let Some(target) = &self.nat {
            self.run_nat(self.nat_commands(target, "32", COMMENT_NAT, false), "-D")?;
        }

        if let Some(target) = &self.nat6 {
            self.run_nat(self.nat_commands(target, "128", COMMENT_NAT, true), "-D")?;
        }

        if let Some(target) = &self.oracle_nat {
            self.run_nat(
                self.nat_commands(target, "32", COMMENT_ORACLE_NAT, false),
                "-D",
            )?;
        }

        Ok(())
    }
}
