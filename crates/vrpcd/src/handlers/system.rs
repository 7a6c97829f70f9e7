//! Liveness and host telemetry handlers.
//!
//! Everything is read from `/proc`, `/etc/os-release` and `statvfs(3)`.
//! Missing sources degrade to zeroed fields rather than faults.

use std::ffi::CString;
use std::fs;
use std::mem::MaybeUninit;
use std::thread;

use serde_json::{Map, Value, json};
use tracing::debug;
use vrpc_protocol::{RpcFault, unix_timestamp};

use super::{HANDLER_TARGET, percentage};
use crate::server::RequestContext;

/// Version reported by `system/info`.
pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

const OS_RELEASE: &str = "/etc/os-release";
const MEMINFO: &str = "/proc/meminfo";
const PROC_STAT: &str = "/proc/stat";
const LOADAVG: &str = "/proc/loadavg";

/// Answers a liveness probe.
///
/// # Errors
///
/// Never fails.
pub fn ping(ctx: &mut RequestContext<'_>) -> Result<Value, RpcFault> {
    Ok(json!({
        "timestamp": unix_timestamp(),
        "uptime": ctx.uptime.as_secs(),
        "message": "pong",
    }))
}

/// Describes the host.
///
/// # Errors
///
/// Never fails; unreadable sources yield defaults.
pub fn info(_ctx: &mut RequestContext<'_>) -> Result<Value, RpcFault> {
    let os = read_kernel_value("ostype").unwrap_or_else(|| "Linux".to_owned());
    let kernel = read_kernel_value("osrelease").unwrap_or_default();
    let os_version = fs::read_to_string(OS_RELEASE)
        .ok()
        .and_then(|text| pretty_name(&text))
        .unwrap_or_else(|| format!("{os} {kernel}"));
    let memory = read_meminfo();
    Ok(json!({
        "hostname": read_kernel_value("hostname").unwrap_or_default(),
        "os": os,
        "os_version": os_version,
        "kernel": kernel,
        "arch": std::env::consts::ARCH,
        "cpu_count": thread::available_parallelism().map_or(1, usize::from),
        "memory_total": memory.total,
        "memory_available": memory.available,
        "agent_version": AGENT_VERSION,
    }))
}

/// Reports live resource usage.
///
/// # Errors
///
/// Never fails; unreadable sources yield zeroes.
pub fn status(_ctx: &mut RequestContext<'_>) -> Result<Value, RpcFault> {
    let cpu_usage = fs::read_to_string(PROC_STAT)
        .ok()
        .and_then(|text| parse_cpu_usage(&text))
        .unwrap_or(0.0);
    let memory = read_meminfo();
    let memory_usage = if memory.total == 0 {
        0.0
    } else {
        percentage(memory.total.saturating_sub(memory.available), memory.total)
    };
    let mut disk_usage = Map::new();
    if let Some(usage) = disk_usage_percent("/") {
        disk_usage.insert("/".to_owned(), json!(usage));
    }
    let load_average = fs::read_to_string(LOADAVG)
        .ok()
        .and_then(|text| parse_load_average(&text))
        .unwrap_or([0.0; 3]);
    Ok(json!({
        "cpu_usage": cpu_usage,
        "memory_usage": memory_usage,
        "disk_usage": disk_usage,
        "load_average": load_average,
        "process_count": process_count(),
    }))
}

fn read_kernel_value(name: &str) -> Option<String> {
    fs::read_to_string(format!("/proc/sys/kernel/{name}"))
        .ok()
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

/// `PRETTY_NAME` from an os-release document, unquoted.
fn pretty_name(os_release: &str) -> Option<String> {
    os_release
        .lines()
        .filter_map(|line| line.trim().split_once('='))
        .find(|(key, _)| *key == "PRETTY_NAME")
        .map(|(_, value)| value.trim_matches(['"', '\'']).to_owned())
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct MemInfo {
    total: u64,
    available: u64,
}

fn read_meminfo() -> MemInfo {
    fs::read_to_string(MEMINFO)
        .map(|text| parse_meminfo(&text))
        .unwrap_or_default()
}

/// Byte totals from `/proc/meminfo`, falling back to `MemFree` when
/// `MemAvailable` is absent.
fn parse_meminfo(text: &str) -> MemInfo {
    let field = |name: &str| {
        text.lines()
            .filter_map(|line| line.split_once(':'))
            .find(|(key, _)| key.trim() == name)
            .and_then(|(_, value)| value.split_whitespace().next())
            .and_then(|kib| kib.parse::<u64>().ok())
            .map(|kib| kib.saturating_mul(1024))
    };
    MemInfo {
        total: field("MemTotal").unwrap_or(0),
        available: field("MemAvailable").or_else(|| field("MemFree")).unwrap_or(0),
    }
}

/// Busy share of CPU time since boot from the aggregate `cpu` line.
fn parse_cpu_usage(proc_stat: &str) -> Option<f64> {
    let mut fields = proc_stat.lines().next()?.split_whitespace();
    if fields.next()? != "cpu" {
        return None;
    }
    let ticks: Vec<u64> = fields.filter_map(|field| field.parse().ok()).collect();
    let idle = *ticks.get(3)?;
    let total = ticks.iter().fold(0_u64, |sum, tick| sum.saturating_add(*tick));
    (total > 0).then(|| percentage(total.saturating_sub(idle), total))
}

fn parse_load_average(loadavg: &str) -> Option<[f64; 3]> {
    let mut values = loadavg.split_whitespace().map(str::parse::<f64>);
    Some([values.next()?.ok()?, values.next()?.ok()?, values.next()?.ok()?])
}

fn process_count() -> usize {
    fs::read_dir("/proc").map_or(0, |entries| {
        entries
            .filter_map(Result::ok)
            .filter(|entry| {
                let file_name = entry.file_name();
                let name = file_name.to_string_lossy();
                !name.is_empty() && name.bytes().all(|byte| byte.is_ascii_digit())
            })
            .count()
    })
}

fn disk_usage_percent(mount: &str) -> Option<f64> {
    let path = CString::new(mount).ok()?;
    let mut raw = MaybeUninit::<libc::statvfs>::uninit();
    // SAFETY: `path` is NUL-terminated and `raw` is valid for writes.
    let result = unsafe { libc::statvfs(path.as_ptr(), raw.as_mut_ptr()) };
    if result != 0 {
        debug!(target: HANDLER_TARGET, mount, "statvfs failed");
        return None;
    }
    // SAFETY: statvfs succeeded, so the structure is initialised.
    let stats = unsafe { raw.assume_init() };
    let fragment = u64::from(stats.f_frsize);
    let total = u64::from(stats.f_blocks).saturating_mul(fragment);
    let free = u64::from(stats.f_bfree).saturating_mul(fragment);
    (total > 0).then(|| percentage(total.saturating_sub(free), total))
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::tests::support::HandlerHarness;

    #[test]
    fn ping_reports_pong_and_uptime() {
        let mut harness = HandlerHarness::new();
        let reply = harness.call(ping, json!({})).expect("ping");
        assert_eq!(reply["message"], "pong");
        assert_eq!(reply["uptime"], 7);
        assert!(reply["timestamp"].as_u64().is_some_and(|ts| ts > 0));
    }

    #[test]
    fn info_reports_the_agent_version() {
        let mut harness = HandlerHarness::new();
        let reply = harness.call(info, json!({})).expect("info");
        assert_eq!(reply["agent_version"], AGENT_VERSION);
        assert!(reply["cpu_count"].as_u64().is_some_and(|count| count >= 1));
        assert_eq!(reply["arch"], std::env::consts::ARCH);
    }

    #[test]
    fn status_has_every_field() {
        let mut harness = HandlerHarness::new();
        let reply = harness.call(status, json!({})).expect("status");
        for field in ["cpu_usage", "memory_usage", "disk_usage", "load_average", "process_count"] {
            assert!(reply.get(field).is_some(), "missing {field}");
        }
        assert_eq!(reply["load_average"].as_array().map(Vec::len), Some(3));
    }

    #[rstest]
    #[case("NAME=\"Debian\"\nPRETTY_NAME=\"Debian GNU/Linux 12 (bookworm)\"\n", Some("Debian GNU/Linux 12 (bookworm)"))]
    #[case("PRETTY_NAME=Alpine\n", Some("Alpine"))]
    #[case("NAME=x\n", None)]
    fn pretty_name_is_unquoted(#[case] text: &str, #[case] expected: Option<&str>) {
        assert_eq!(pretty_name(text).as_deref(), expected);
    }

    #[test]
    fn meminfo_is_converted_to_bytes() {
        let text = "MemTotal:       2048 kB\nMemFree:         512 kB\nMemAvailable:   1024 kB\n";
        assert_eq!(
            parse_meminfo(text),
            MemInfo {
                total: 2048 * 1024,
                available: 1024 * 1024
            }
        );
    }

    #[test]
    fn meminfo_falls_back_to_free_memory() {
        let text = "MemTotal: 100 kB\nMemFree: 25 kB\n";
        assert_eq!(parse_meminfo(text).available, 25 * 1024);
    }

    #[test]
    fn cpu_usage_counts_non_idle_ticks() {
        let usage = parse_cpu_usage("cpu  10 0 10 80 0 0 0 0 0 0\ncpu0 1 2 3 4\n");
        assert_eq!(usage, Some(20.0));
    }

    #[rstest]
    #[case("")]
    #[case("intr 1 2 3")]
    #[case("cpu  0 0 0 0")]
    fn unusable_cpu_lines_yield_nothing(#[case] text: &str) {
        assert_eq!(parse_cpu_usage(text), None);
    }

    #[test]
    fn load_average_reads_three_values() {
        assert_eq!(parse_load_average("0.50 1.25 2.00 1/234 5678"), Some([0.5, 1.25, 2.0]));
        assert_eq!(parse_load_average("0.50"), None);
    }
}
