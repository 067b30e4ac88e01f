/// Utility functions and helpers
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Generate a unique ID based on timestamp and random component
pub fn generate_id(prefix: &str) -> String {
    let random: u32 = rand::random();
    format!("{}-{}-{:x}", prefix, unix_now_ms(), random)
}

/// Current time in Unix seconds
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Current time in Unix milliseconds
pub fn unix_now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Random alphanumeric string
pub fn random_secret(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Hex MD5 of a file, `None` if it cannot be read
pub async fn file_md5(path: &Path) -> Option<String> {
    let content = tokio::fs::read(path).await.ok()?;
    Some(format!("{:x}", md5::compute(content)))
}

/// Host uptime from /proc/uptime
pub fn host_uptime() -> Option<Duration> {
    let content = std::fs::read_to_string("/proc/uptime").ok()?;
    parse_uptime(&content)
}

fn parse_uptime(content: &str) -> Option<Duration> {
    let secs = content.split_whitespace().next()?.parse::<f64>().ok()?;
    Some(Duration::from_secs_f64(secs.max(0.0)))
}

/// Hostname of this node
pub fn hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|h| h.trim().to_string())
                .filter(|h| !h.is_empty())
        })
        .unwrap_or_else(|| "localhost".to_string())
}

/// Format duration for human-readable output
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m{}s", secs / 60, secs % 60)
    } else {
        format!("{}h{}m{}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(30)), "30s");
        assert_eq!(format_duration(Duration::from_secs(90)), "1m30s");
        assert_eq!(format_duration(Duration::from_secs(3661)), "1h1m1s");
    }

    #[test]
    fn test_generate_id() {
        let id1 = generate_id("cid");
        let id2 = generate_id("cid");

        assert!(id1.starts_with("cid-"));
        assert!(id2.starts_with("cid-"));
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_random_secret() {
        let secret = random_secret(24);
        assert_eq!(secret.len(), 24);
        assert!(secret.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_parse_uptime() {
        assert_eq!(
            parse_uptime("3600.52 7100.10\n").map(|d| d.as_secs()),
            Some(3600)
        );
        assert!(parse_uptime("garbage").is_none());
    }

    #[tokio::test]
    async fn test_file_md5() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("redis.conf");
        std::fs::write(&path, "port 63001\n").unwrap();

        let digest = file_md5(&path).await.unwrap();
        assert_eq!(digest, format!("{:x}", md5::compute("port 63001\n")));
        assert!(file_md5(&dir.path().join("missing")).await.is_none());
    }
}
