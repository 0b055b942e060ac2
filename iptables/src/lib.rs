//! Builds complete packet-filter rulesets in memory and applies them by
//! replacing the live tables in a single restore-tool invocation. Partial
//! rule states are never observable: the host tool commits each table
//! atomically, so a failed replace leaves the previous rules in place.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

use std::process::Stdio;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

pub const TABLE_FILTER: &str = "filter";
pub const TABLE_NAT: &str = "nat";

pub const CHAIN_INPUT: &str = "INPUT";
pub const CHAIN_FORWARD: &str = "FORWARD";
pub const CHAIN_POST_ROUTING: &str = "POSTROUTING";
pub const CHAIN_MASQUERADE: &str = "MASQUERADE";

pub const CHAIN_FABEDGE_INPUT: &str = "FABEDGE-INPUT";
pub const CHAIN_FABEDGE_FORWARD: &str = "FABEDGE-FORWARD";
pub const CHAIN_FABEDGE_POST_ROUTING: &str = "FABEDGE-POSTROUTING";
pub const CHAIN_FABEDGE_NAT_OUTGOING: &str = "FABEDGE-NAT-OUTGOING";

const IPTABLES_RESTORE: &str = "iptables-restore";
const IP6TABLES_RESTORE: &str = "ip6tables-restore";

/// Address family a ruleset applies to. The two families differ only in the
/// name of the restore tool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Protocol {
    Ipv4,
    Ipv6,
}

impl Protocol {
    fn restore_command(self) -> &'static str {
        match self {
            Protocol::Ipv4 => IPTABLES_RESTORE,
            Protocol::Ipv6 => IP6TABLES_RESTORE,
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to run {command}: {source}")]
    Spawn {
        command: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error(
        "{command} exited with {status}: stdout = {stdout:?}; stderr = {stderr:?}"
    )]
    RestoreFailed {
        command: &'static str,
        status: std::process::ExitStatus,
        stdout: String,
        stderr: String,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct Rule {
    chain: String,
    args: Vec<String>,
}

#[derive(Clone, Debug, Default)]
struct RuleSet {
    table: String,
    chains: Vec<String>,
    rules: Vec<Rule>,
}

/// Accumulates tables, chains, and rules, then renders the textual form the
/// restore tool consumes.
#[derive(Clone, Debug)]
pub struct Iptables {
    protocol: Protocol,
    rule_sets: Vec<RuleSet>,
}

// === impl Iptables ===

impl Iptables {
    pub fn ipv4() -> Self {
        Self::new(Protocol::Ipv4)
    }

    pub fn ipv6() -> Self {
        Self::new(Protocol::Ipv6)
    }

    pub fn new(protocol: Protocol) -> Self {
        Self {
            protocol,
            rule_sets: Vec::new(),
        }
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Registers a chain, creating its table entry if needed. Idempotent; a
    /// registered chain is emitted even if no rules are appended to it.
    pub fn create_chain(&mut self, table: &str, chain: &str) {
        let rule_set = match self.rule_sets.iter_mut().find(|rs| rs.table == table) {
            Some(rs) => rs,
            None => {
                self.rule_sets.push(RuleSet {
                    table: table.to_string(),
                    ..RuleSet::default()
                });
                self.rule_sets.last_mut().unwrap()
            }
        };
        if !rule_set.chains.iter().any(|c| c == chain) {
            rule_set.chains.push(chain.to_string());
        }
    }

    /// Appends a rule unless an identical argument vector already exists in
    /// the chain. Rules within a chain are compared byte-wise.
    pub fn append_unique_rule(&mut self, table: &str, chain: &str, args: &[&str]) {
        self.create_chain(table, chain);

        let rule_set = self
            .rule_sets
            .iter_mut()
            .find(|rs| rs.table == table)
            .expect("table was just registered");
        let rule = Rule {
            chain: chain.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        };
        if rule_set
            .rules
            .iter()
            .any(|r| r.chain == rule.chain && r.args == rule.args)
        {
            return;
        }
        rule_set.rules.push(rule);
    }

    /// Resets the in-memory accumulator.
    pub fn clear_all_rules(&mut self) {
        self.rule_sets.clear();
    }

    /// Renders the restore-tool input: per table, a `*<table>` header, one
    /// `:<chain> <policy> [0:0]` line per registered chain, the `-A` rules,
    /// and a single `COMMIT`.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for rule_set in &self.rule_sets {
            out.push('*');
            out.push_str(&rule_set.table);
            out.push('\n');

            for chain in &rule_set.chains {
                // Custom chains never get a default policy.
                let policy = if is_builtin_chain(&rule_set.table, chain) {
                    "ACCEPT"
                } else {
                    "-"
                };
                out.push_str(&format!(":{chain} {policy} [0:0]\n"));
            }

            for rule in &rule_set.rules {
                out.push_str("-A ");
                out.push_str(&rule.chain);
                for arg in &rule.args {
                    out.push(' ');
                    out.push_str(arg);
                }
                out.push('\n');
            }

            out.push_str("COMMIT\n");
        }
        out
    }

    /// Replaces the live tables with the accumulated ruleset. The restore
    /// tool is invoked with `--wait` and commits each table atomically.
    pub async fn replace_rules(&self) -> Result<(), Error> {
        let command = self.protocol.restore_command();
        let input = self.render();
        debug!(%command, bytes = input.len(), "replacing packet-filter rules");

        let mut child = Command::new(command)
            .arg("--wait")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| Error::Spawn { command, source })?;

        let mut stdin = child.stdin.take().expect("stdin was requested");
        stdin
            .write_all(input.as_bytes())
            .await
            .map_err(|source| Error::Spawn { command, source })?;
        drop(stdin);

        let output = child
            .wait_with_output()
            .await
            .map_err(|source| Error::Spawn { command, source })?;
        if !output.status.success() {
            return Err(Error::RestoreFailed {
                command,
                status: output.status,
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        Ok(())
    }

    // Fixed rule patterns shared by the connector and the edge agents.

    /// Routes FORWARD traffic through the FABEDGE-FORWARD chain.
    pub fn prepare_forward_chain(&mut self) {
        self.create_chain(TABLE_FILTER, CHAIN_FABEDGE_FORWARD);
        self.append_unique_rule(TABLE_FILTER, CHAIN_FORWARD, &["-j", CHAIN_FABEDGE_FORWARD]);
    }

    /// Routes POSTROUTING traffic through the FABEDGE-POSTROUTING chain.
    pub fn prepare_post_routing_chain(&mut self) {
        self.create_chain(TABLE_NAT, CHAIN_FABEDGE_POST_ROUTING);
        self.append_unique_rule(
            TABLE_NAT,
            CHAIN_POST_ROUTING,
            &["-j", CHAIN_FABEDGE_POST_ROUTING],
        );
    }

    pub fn maintain_forward_rules_for_ipset(&mut self, ipset_names: &[String]) {
        self.prepare_forward_chain();
        self.append_unique_rule(
            TABLE_FILTER,
            CHAIN_FABEDGE_FORWARD,
            &[
                "-m",
                "conntrack",
                "--ctstate",
                "RELATED,ESTABLISHED",
                "-j",
                "ACCEPT",
            ],
        );
        for name in ipset_names {
            self.append_unique_rule(
                TABLE_FILTER,
                CHAIN_FABEDGE_FORWARD,
                &["-m", "set", "--match-set", name, "src", "-j", "ACCEPT"],
            );
            self.append_unique_rule(
                TABLE_FILTER,
                CHAIN_FABEDGE_FORWARD,
                &["-m", "set", "--match-set", name, "dst", "-j", "ACCEPT"],
            );
        }
    }

    pub fn maintain_forward_rules_for_subnets(&mut self, subnets: &[String]) {
        for subnet in subnets {
            self.append_unique_rule(
                TABLE_FILTER,
                CHAIN_FABEDGE_FORWARD,
                &["-s", subnet, "-j", "ACCEPT"],
            );
            self.append_unique_rule(
                TABLE_FILTER,
                CHAIN_FABEDGE_FORWARD,
                &["-d", subnet, "-j", "ACCEPT"],
            );
        }
    }

    /// Masquerades traffic leaving the overlay, except when the destination
    /// is a known peer network or inside the source subnet itself.
    pub fn maintain_nat_outgoing_rules_for_subnets(&mut self, subnets: &[String], ipset_name: &str) {
        for subnet in subnets {
            self.append_unique_rule(
                TABLE_NAT,
                CHAIN_FABEDGE_NAT_OUTGOING,
                &[
                    "-s",
                    subnet,
                    "-m",
                    "set",
                    "--match-set",
                    ipset_name,
                    "dst",
                    "-j",
                    "RETURN",
                ],
            );
            self.append_unique_rule(
                TABLE_NAT,
                CHAIN_FABEDGE_NAT_OUTGOING,
                &["-s", subnet, "-d", subnet, "-j", "RETURN"],
            );
            self.append_unique_rule(
                TABLE_NAT,
                CHAIN_FABEDGE_NAT_OUTGOING,
                &["-s", subnet, "-j", CHAIN_MASQUERADE],
            );
            self.append_unique_rule(
                TABLE_NAT,
                CHAIN_POST_ROUTING,
                &["-j", CHAIN_FABEDGE_NAT_OUTGOING],
            );
        }
    }

    /// Packets carrying the orchestrator's masquerade mark are handed back to
    /// KUBE-POSTROUTING so node-port response traffic is still masqueraded by
    /// the orchestrator's own rules.
    pub fn add_post_routing_rule_for_kubernetes(&mut self) {
        self.create_chain(TABLE_NAT, "KUBE-POSTROUTING");
        self.append_unique_rule(
            TABLE_NAT,
            CHAIN_FABEDGE_POST_ROUTING,
            &[
                "-m",
                "mark",
                "--mark",
                "0x4000/0x4000",
                "-j",
                "KUBE-POSTROUTING",
            ],
        );
    }

    pub fn add_post_routing_rules_for_ipset(&mut self, ipset_name: &str) {
        self.append_unique_rule(
            TABLE_NAT,
            CHAIN_FABEDGE_POST_ROUTING,
            &["-m", "set", "--match-set", ipset_name, "dst", "-j", "ACCEPT"],
        );
        self.append_unique_rule(
            TABLE_NAT,
            CHAIN_FABEDGE_POST_ROUTING,
            &["-m", "set", "--match-set", ipset_name, "src", "-j", "ACCEPT"],
        );
    }

    /// Admits IKE and IPsec control traffic on the host.
    pub fn allow_ipsec(&mut self) {
        self.create_chain(TABLE_FILTER, CHAIN_FABEDGE_INPUT);
        self.append_unique_rule(TABLE_FILTER, CHAIN_INPUT, &["-j", CHAIN_FABEDGE_INPUT]);
        self.append_unique_rule(
            TABLE_FILTER,
            CHAIN_FABEDGE_INPUT,
            &["-p", "udp", "-m", "udp", "--dport", "500", "-j", "ACCEPT"],
        );
        self.append_unique_rule(
            TABLE_FILTER,
            CHAIN_FABEDGE_INPUT,
            &["-p", "udp", "-m", "udp", "--dport", "4500", "-j", "ACCEPT"],
        );
        self.append_unique_rule(
            TABLE_FILTER,
            CHAIN_FABEDGE_INPUT,
            &["-p", "esp", "-j", "ACCEPT"],
        );
        self.append_unique_rule(
            TABLE_FILTER,
            CHAIN_FABEDGE_INPUT,
            &["-p", "ah", "-j", "ACCEPT"],
        );
    }

    pub fn allow_post_routing_for_ipset(&mut self, src: &str, dst: &str) {
        self.append_unique_rule(
            TABLE_NAT,
            CHAIN_FABEDGE_POST_ROUTING,
            &[
                "-m", "set", "--match-set", src, "src", "-m", "set", "--match-set", dst, "dst",
                "-j", "ACCEPT",
            ],
        );
    }

    pub fn masquerade_post_routing_for_ipset(&mut self, src: &str, dst: &str) {
        self.append_unique_rule(
            TABLE_NAT,
            CHAIN_FABEDGE_POST_ROUTING,
            &[
                "-m", "set", "--match-set", src, "src", "-m", "set", "--match-set", dst, "dst",
                "-j", "MASQUERADE",
            ],
        );
    }
}

/// Built-in chains get a default policy; everything else is custom.
fn is_builtin_chain(table: &str, chain: &str) -> bool {
    match table {
        "filter" => matches!(chain, "INPUT" | "OUTPUT" | "FORWARD"),
        "nat" => matches!(chain, "PREROUTING" | "POSTROUTING" | "OUTPUT"),
        "mangle" => matches!(
            chain,
            "PREROUTING" | "OUTPUT" | "FORWARD" | "INPUT" | "POSTROUTING"
        ),
        "raw" => matches!(chain, "PREROUTING" | "OUTPUT"),
        _ => false,
    }
}
