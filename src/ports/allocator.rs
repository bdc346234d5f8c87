use crate::context::OpContext;
use crate::ssh::RemoteShell;
use std::collections::HashSet;

/// Lists listening sockets on the host. `ss` first, `netstat` when `ss` is missing.
pub const LISTENING_PORTS_CMD: &str = "ss -tuln 2>/dev/null || netstat -tuln 2>/dev/null";

/// Finds free host ports inside a provider's configured range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortAllocator {
    start: u16,
    end: u16,
}

impl PortAllocator {
    pub fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    pub fn range_size(&self) -> u32 {
        if self.end < self.start {
            return 0;
        }
        u32::from(self.end) - u32::from(self.start) + 1
    }

    pub fn contains(&self, port: u16) -> bool {
        port >= self.start && port <= self.end
    }

    /// First port that is not `taken`, walking from `cursor` to the end of the range and then
    /// wrapping around to the start.
    pub fn next_free(&self, cursor: u16, taken: impl Fn(u16) -> bool) -> Option<u16> {
        if self.range_size() == 0 {
            return None;
        }
        let from = if self.contains(cursor) { cursor } else { self.start };
        (from..=self.end)
            .chain(self.start..from)
            .find(|port| !taken(*port))
    }

    /// First free port at or after `from`, without wrapping.
    pub fn next_free_forward(&self, from: u16, taken: impl Fn(u16) -> bool) -> Option<u16> {
        if self.range_size() == 0 || from > self.end {
            return None;
        }
        (from.max(self.start)..=self.end).find(|port| !taken(*port))
    }

    /// Value of `next_available_port` after handing out `port`.
    pub fn after(&self, port: u16) -> u16 {
        if port >= self.end {
            self.start
        } else {
            port + 1
        }
    }
}

/// Parse `ss -tuln` or `netstat -tuln` output into the set of listening local ports.
pub fn parse_listening_ports(output: &str) -> HashSet<u16> {
    output
        .lines()
        .filter_map(|line| {
            line.split_whitespace()
                .find(|field| field.contains(':'))
                .and_then(|local| local.rsplit(':').next())
                .and_then(|port| port.parse::<u16>().ok())
        })
        .filter(|port| *port != 0)
        .collect()
}

/// Ports already bound on the host. A failed probe counts as nothing bound, so allocation
/// falls back to the database view alone.
pub async fn probe_listening_ports(shell: &dyn RemoteShell, ctx: &OpContext) -> HashSet<u16> {
    match shell.execute(ctx, LISTENING_PORTS_CMD).await {
        Ok(output) => parse_listening_ports(&output),
        Err(err) => {
            tracing::warn!(error = %err, "检查主机端口占用失败，仅依据数据库分配");
            HashSet::new()
        }
    }
}

#[cfg(test)]
#[path = "allocator_tests.rs"]
mod allocator_tests;
