//! Resident-memory sampling of the engine child
//!
//! macOS ships a `footprint` tool whose phys_footprint figure matches what
//! Activity Monitor charges the process. Where that tool is missing the
//! plain `ps` RSS is close enough for a menu readout.

use tokio::process::Command;
use tracing::trace;

/// Sample the child's resident memory in MiB, `None` when the process is
/// gone or both probes fail.
pub async fn sample_memory_mb(pid: u32) -> Option<u64> {
    let pid_arg = pid.to_string();

    if let Ok(out) = Command::new("footprint").arg(&pid_arg).output().await {
        if out.status.success() {
            if let Some(mb) = parse_footprint(&String::from_utf8_lossy(&out.stdout)) {
                trace!("footprint reports {mb} MB for pid {pid}");
                return Some(mb);
            }
        }
    }

    let out = Command::new("ps")
        .args(["-o", "rss=", "-p", &pid_arg])
        .output()
        .await
        .ok()?;
    if !out.status.success() {
        return None;
    }
    let rss_kib: u64 = String::from_utf8_lossy(&out.stdout).trim().parse().ok()?;
    Some(rss_kib / 1024)
}

/// Find the `Footprint: <value> <unit>` line and convert to MiB.
fn parse_footprint(output: &str) -> Option<u64> {
    for line in output.lines() {
        let Some(rest) = line.trim().strip_prefix("Footprint:") else {
            continue;
        };
        let mut parts = rest.split_whitespace();
        let Some(value) = parts.next().and_then(|v| v.parse::<f64>().ok()) else {
            continue;
        };
        let mb = match parts.next() {
            Some("KB") => value / 1024.0,
            Some("GB") => value * 1024.0,
            Some("MB") | None => value,
            Some(_) => continue,
        };
        return Some(mb.round() as u64);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_units() {
        assert_eq!(parse_footprint("Footprint: 512 MB"), Some(512));
        assert_eq!(parse_footprint("Footprint: 2048 KB"), Some(2));
        assert_eq!(parse_footprint("Footprint: 1.5 GB"), Some(1536));
        assert_eq!(parse_footprint("Footprint: 287.4 MB"), Some(287));
    }

    #[test]
    fn test_parse_finds_line_in_full_output() {
        let output = "\
llama-server [4242]: accounting summary
  phys footprint breakdown follows
  Footprint: 4821 MB
  peak footprint: 5020 MB
";
        assert_eq!(parse_footprint(output), Some(4821));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert_eq!(parse_footprint(""), None);
        assert_eq!(parse_footprint("no such process"), None);
        assert_eq!(parse_footprint("Footprint: lots MB"), None);
        assert_eq!(parse_footprint("Footprint: 12 parsecs"), None);
    }
}
