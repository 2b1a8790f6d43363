use log::info;

const SIXTEEN_GIGABYTES_KB: u64 = 16 * 1024 * 1024;
const SMALL_QUEUE: usize = 1000;
const LARGE_QUEUE: usize = 10000;

#[derive(Debug)]
pub struct MemoryStats {
    pub rss_mb: f64,
    pub total_mb: Option<f64>,
}

#[cfg(target_os = "linux")]
fn meminfo_kb(content: &str, key: &str) -> Option<u64> {
    content
        .lines()
        .find(|line| line.starts_with(key))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|s| s.parse::<u64>().ok())
}

#[cfg(target_os = "linux")]
pub fn total_memory_kb() -> Option<u64> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    meminfo_kb(&meminfo, "MemTotal:")
}

#[cfg(not(target_os = "linux"))]
pub fn total_memory_kb() -> Option<u64> {
    None
}

#[cfg(target_os = "linux")]
pub fn memory_usage() -> Option<MemoryStats> {
    let status = std::fs::read_to_string(format!("/proc/{}/status", std::process::id())).ok()?;
    let rss_kb = meminfo_kb(&status, "VmRSS:")?;
    Some(MemoryStats { rss_mb: rss_kb as f64 / 1024.0, total_mb: total_memory_kb().map(|kb| kb as f64 / 1024.0) })
}

#[cfg(not(target_os = "linux"))]
pub fn memory_usage() -> Option<MemoryStats> {
    None
}

/// Work queue bound derived from physical memory: small hosts queue fewer pending rows.
pub fn default_queue_capacity() -> usize {
    queue_capacity_for(total_memory_kb())
}

fn queue_capacity_for(total_kb: Option<u64>) -> usize {
    match total_kb {
        Some(kb) if kb >= SIXTEEN_GIGABYTES_KB => LARGE_QUEUE,
        _ => SMALL_QUEUE,
    }
}

pub fn log_memory_usage(note: &str) {
    match memory_usage() {
        Some(stats) => {
            let total = stats.total_mb.map_or_else(|| "N/A".to_string(), |t| format!("{:.0} MB", t));
            info!("Memory usage ({}): {:.1} MB physical (RSS) of {} total", note, stats.rss_mb, total);
        }
        None => info!("Memory usage tracking not available on this platform ({})", std::env::consts::OS),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_capacity_scales_with_memory() {
        assert_eq!(queue_capacity_for(None), SMALL_QUEUE);
        assert_eq!(queue_capacity_for(Some(8 * 1024 * 1024)), SMALL_QUEUE);
        assert_eq!(queue_capacity_for(Some(SIXTEEN_GIGABYTES_KB)), LARGE_QUEUE);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn parses_meminfo_lines() {
        let content = "MemTotal:       32658428 kB\nMemFree:         1234 kB\n";
        assert_eq!(meminfo_kb(content, "MemTotal:"), Some(32658428));
        assert_eq!(meminfo_kb(content, "Swap:"), None);
    }
}
