//! Traffic-control planning for degraded test links.
//!
//! Each [`ShapingRule`] becomes a short list of `tc qdisc` invocations:
//! the existing root qdisc is removed, then either a lone `netem` root or,
//! when a rate limit is set, a `tbf` root with `netem` as its child.

use std::fmt;
use std::io::ErrorKind;
use std::process::Command;

use crate::config::ShapingRule;
use crate::error::{Result, TestbedError};

const TC: &str = "tc";
const MIN_BURST_BYTES: u32 = 32_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcCommand {
    pub args: Vec<String>,
    /// Failure is expected and ignored (deleting a qdisc that may not exist).
    pub allow_failure: bool,
}

impl fmt::Display for TcCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{TC} {}", self.args.join(" "))
    }
}

fn tc(args: &[&str], allow_failure: bool) -> TcCommand {
    TcCommand {
        args: args.iter().map(|s| s.to_string()).collect(),
        allow_failure,
    }
}

fn netem_args(rule: &ShapingRule) -> Vec<String> {
    let mut args = vec!["netem".to_string()];
    if let Some(loss) = rule.loss_percent.filter(|l| *l > 0.0) {
        args.extend(["loss".into(), format!("{loss}%")]);
    }
    let delay = rule.delay_ms.unwrap_or(0);
    let jitter = rule.jitter_ms.unwrap_or(0);
    if delay > 0 || jitter > 0 {
        args.extend(["delay".into(), format!("{delay}ms")]);
        if jitter > 0 {
            args.push(format!("{jitter}ms"));
        }
    }
    args
}

/// Remove whatever root qdisc `interface` has.
pub fn clear(interface: &str) -> TcCommand {
    tc(&["qdisc", "del", "dev", interface, "root"], true)
}

/// Commands that put `rule` in place on its interface.
pub fn plan(rule: &ShapingRule) -> Vec<TcCommand> {
    let dev = rule.interface.as_str();
    let mut commands = vec![clear(dev)];
    let netem = netem_args(rule);
    let has_netem = netem.len() > 1;

    match rule.rate_kbit.filter(|r| *r > 0) {
        Some(rate) => {
            let burst = rate.max(MIN_BURST_BYTES);
            let mut root = tc(&["qdisc", "add", "dev", dev, "root", "handle", "1:", "tbf"], false);
            root.args.extend([
                "rate".into(),
                format!("{rate}kbit"),
                "burst".into(),
                burst.to_string(),
                "limit".into(),
                (burst * 2).to_string(),
            ]);
            commands.push(root);
            if has_netem {
                let mut child = tc(&["qdisc", "add", "dev", dev, "parent", "1:1", "handle", "10:"], false);
                child.args.extend(netem);
                commands.push(child);
            }
        }
        None if has_netem => {
            let mut root = tc(&["qdisc", "add", "dev", dev, "root", "handle", "1:"], false);
            root.args.extend(netem);
            commands.push(root);
        }
        None => {}
    }
    commands
}

/// Run the commands in order, stopping at the first unexpected failure.
pub fn apply(commands: &[TcCommand]) -> Result<()> {
    for command in commands {
        let output = Command::new(TC).args(&command.args).output().map_err(|e| {
            if e.kind() == ErrorKind::NotFound {
                TestbedError::BinaryMissing(TC.into())
            } else {
                TestbedError::Io(e)
            }
        })?;
        if output.status.success() {
            tracing::info!(command = %command, "applied");
        } else if command.allow_failure {
            tracing::debug!(command = %command, status = %output.status, "ignored failure");
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(TestbedError::Io(std::io::Error::other(format!(
                "{command}: {}",
                stderr.trim()
            ))));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule() -> ShapingRule {
        ShapingRule {
            interface: "veth1".into(),
            ..ShapingRule::default()
        }
    }

    fn lines(rule: &ShapingRule) -> Vec<String> {
        plan(rule).iter().map(|c| c.to_string()).collect()
    }

    #[test]
    fn netem_only() {
        let r = ShapingRule {
            delay_ms: Some(50),
            jitter_ms: Some(10),
            loss_percent: Some(1.5),
            ..rule()
        };
        assert_eq!(
            lines(&r),
            vec![
                "tc qdisc del dev veth1 root",
                "tc qdisc add dev veth1 root handle 1: netem loss 1.5% delay 50ms 10ms",
            ]
        );
        assert!(plan(&r)[0].allow_failure);
    }

    #[test]
    fn rate_with_netem_child() {
        let r = ShapingRule {
            loss_percent: Some(2.0),
            rate_kbit: Some(4000),
            ..rule()
        };
        assert_eq!(
            lines(&r),
            vec![
                "tc qdisc del dev veth1 root",
                "tc qdisc add dev veth1 root handle 1: tbf rate 4000kbit burst 32000 limit 64000",
                "tc qdisc add dev veth1 parent 1:1 handle 10: netem loss 2%",
            ]
        );
    }

    #[test]
    fn jitter_alone_gets_zero_delay() {
        let r = ShapingRule {
            jitter_ms: Some(5),
            ..rule()
        };
        assert!(lines(&r)[1].ends_with("netem delay 0ms 5ms"));
    }

    #[test]
    fn empty_rule_only_clears() {
        assert_eq!(lines(&rule()), vec!["tc qdisc del dev veth1 root"]);
    }
}
