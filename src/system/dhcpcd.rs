//! Reading and appending static address blocks in `dhcpcd.conf`.
//!
//! The file is a flat list of lines. An `interface <name>` header opens a
//! block which runs until the next blank line or the next header. Comments
//! start with `#`. We only ever append to it.

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::network::Ipv4Cidr;
use crate::error::{NetkeeperError, Result};

/// Default location of the dhcpcd configuration on Raspberry Pi OS.
pub const DHCPCD_CONF: &str = "/etc/dhcpcd.conf";

const INTERFACE_PREFIX: &str = "interface ";
const STATIC_IP_PREFIX: &str = "static ip_address=";

/// Scanner position relative to the block we're looking for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockState {
    Outside,
    InsideTarget,
}

/// Whether an `interface <name>` block in `content` declares a
/// `static ip_address=`. Single pass, no lookbehind.
pub fn has_static_ip_in(content: &str, interface: &str) -> bool {
    let header = format!("{}{}", INTERFACE_PREFIX, interface);
    let mut state = BlockState::Outside;

    for line in content.lines() {
        let line = line.trim();

        if line.is_empty() {
            state = BlockState::Outside;
            continue;
        }
        if line.starts_with('#') {
            continue;
        }

        match state {
            BlockState::Outside => {
                if line == header {
                    state = BlockState::InsideTarget;
                }
            }
            BlockState::InsideTarget => {
                if line.starts_with(INTERFACE_PREFIX) {
                    state = BlockState::Outside;
                } else if line.starts_with(STATIC_IP_PREFIX) {
                    return true;
                }
            }
        }
    }

    false
}

/// Render the text appended for a new static block, including the leading
/// newline that separates it from whatever precedes it.
///
/// dhcpcd takes the CIDR form for `ip_address` but a bare address for
/// `domain_name_servers`; the interface's own address stands in as resolver.
pub fn render_static_block(interface: &str, address: Ipv4Cidr, gateway: Option<IpAddr>) -> String {
    let mut block = format!(
        "\n{}{}\n{}{}\n",
        INTERFACE_PREFIX, interface, STATIC_IP_PREFIX, address
    );
    if let Some(gateway) = gateway {
        block.push_str(&format!("static routers={}\n", gateway));
    }
    let dns: Ipv4Addr = address.addr();
    block.push_str(&format!("static domain_name_servers={}\n\n", dns));
    block
}

/// Replace `path` with `contents` without ever leaving it half written.
///
/// Symlinks are followed so the link itself survives. Writes a sibling temp
/// file next to the real target, syncs it, copies the original's permissions
/// and owner, and renames it over the target. On failure the temp file is
/// removed and the original is left as it was.
pub async fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let target = resolve_target(path).await?;
    let file_name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "dhcpcd.conf".into());
    let tmp_path = target.with_file_name(format!(".{}.tmp", file_name));

    let result = async {
        let mut file = fs::File::create(&tmp_path).await?;
        file.write_all(contents).await?;
        file.sync_all().await?;
        drop(file);

        if let Ok(meta) = fs::metadata(&target).await {
            fs::set_permissions(&tmp_path, meta.permissions()).await?;
            copy_owner(&meta, &tmp_path).await?;
        }

        fs::rename(&tmp_path, &target).await
    }
    .await;

    if let Err(e) = result {
        let _ = fs::remove_file(&tmp_path).await;
        return Err(NetkeeperError::io(path, e));
    }

    debug!("wrote {} bytes to {}", contents.len(), target.display());
    Ok(())
}

/// Real path behind `path`. A file that doesn't exist yet is written as is.
async fn resolve_target(path: &Path) -> Result<PathBuf> {
    match fs::canonicalize(path).await {
        Ok(target) => Ok(target),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(path.to_path_buf()),
        Err(e) => Err(NetkeeperError::io(path, e)),
    }
}

#[cfg(unix)]
async fn copy_owner(original: &std::fs::Metadata, tmp_path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::MetadataExt;

    let tmp = fs::metadata(tmp_path).await?;
    if tmp.uid() == original.uid() && tmp.gid() == original.gid() {
        return Ok(());
    }
    std::os::unix::fs::chown(tmp_path, Some(original.uid()), Some(original.gid()))
}

#[cfg(not(unix))]
async fn copy_owner(_original: &std::fs::Metadata, _tmp_path: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
# A sample configuration for dhcpcd.
hostname
clientid
persistent
option rapid_commit

# Example static IP configuration:
#interface eth0
#static ip_address=192.168.0.10/24

interface wlan0
    static ip_address=192.168.1.20/24
    static routers=192.168.1.1

interface eth1
static routers=10.0.0.1
";

    #[test]
    fn test_has_static_ip_finds_indented_declaration() {
        assert!(has_static_ip_in(SAMPLE, "wlan0"));
    }

    #[test]
    fn test_has_static_ip_ignores_commented_block() {
        assert!(!has_static_ip_in(SAMPLE, "eth0"));
    }

    #[test]
    fn test_has_static_ip_block_without_address() {
        assert!(!has_static_ip_in(SAMPLE, "eth1"));
    }

    #[test]
    fn test_has_static_ip_unknown_interface() {
        assert!(!has_static_ip_in(SAMPLE, "usb0"));
        assert!(!has_static_ip_in("", "eth0"));
    }

    #[test]
    fn test_header_without_blank_line_ends_block() {
        let content = "interface eth0\ninterface eth1\nstatic ip_address=1.2.3.4/24\n";
        assert!(!has_static_ip_in(content, "eth0"));
        assert!(has_static_ip_in(content, "eth1"));
    }

    #[test]
    fn test_blank_line_ends_block() {
        let content = "interface eth0\n\nstatic ip_address=1.2.3.4/24\n";
        assert!(!has_static_ip_in(content, "eth0"));

        // Whitespace-only lines count as blank
        let content = "interface eth0\n   \t\nstatic ip_address=1.2.3.4/24\n";
        assert!(!has_static_ip_in(content, "eth0"));
    }

    #[test]
    fn test_comment_inside_block_is_skipped() {
        let content = "interface eth0\n# pinned by admin\nstatic ip_address=1.2.3.4/24\n";
        assert!(has_static_ip_in(content, "eth0"));
    }

    #[test]
    fn test_header_must_match_exactly() {
        let content = "interface eth0.100\nstatic ip_address=1.2.3.4/24\n";
        assert!(!has_static_ip_in(content, "eth0"));

        let content = "  interface eth0  \r\nstatic ip_address=1.2.3.4/24\r\n";
        assert!(has_static_ip_in(content, "eth0"));
    }

    #[test]
    fn test_duplicate_block_is_still_scanned() {
        let content = "\
interface eth0
static routers=10.0.0.1

interface eth0
static ip_address=10.0.0.5/24
";
        // Scanning keeps going after the first block closes, so a later
        // block with an address is still found.
        assert!(has_static_ip_in(content, "eth0"));
    }

    #[test]
    fn test_render_static_block_with_gateway() {
        let cidr: Ipv4Cidr = "10.0.0.5/24".parse().unwrap();
        let gateway = Some("10.0.0.1".parse().unwrap());
        assert_eq!(
            render_static_block("eth0", cidr, gateway),
            "\ninterface eth0\n\
             static ip_address=10.0.0.5/24\n\
             static routers=10.0.0.1\n\
             static domain_name_servers=10.0.0.5\n\n"
        );
    }

    #[test]
    fn test_render_static_block_without_gateway() {
        let cidr: Ipv4Cidr = "192.168.4.2/16".parse().unwrap();
        let block = render_static_block("wlan0", cidr, None);
        assert!(!block.contains("routers"));
        assert!(block.ends_with("static domain_name_servers=192.168.4.2\n\n"));
    }

    #[tokio::test]
    async fn test_write_atomic_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dhcpcd.conf");
        std::fs::write(&path, "old\n").unwrap();

        write_atomic(&path, b"new\n").await.unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "new\n");
        assert!(!dir.path().join(".dhcpcd.conf.tmp").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_write_atomic_keeps_symlink() {
        let dir = tempfile::tempdir().unwrap();
        let real = dir.path().join("dhcpcd.conf.real");
        let link = dir.path().join("dhcpcd.conf");
        std::fs::write(&real, "old\n").unwrap();
        std::os::unix::fs::symlink(&real, &link).unwrap();

        write_atomic(&link, b"new\n").await.unwrap();

        assert!(std::fs::symlink_metadata(&link).unwrap().file_type().is_symlink());
        assert_eq!(std::fs::read_to_string(&real).unwrap(), "new\n");
        assert_eq!(std::fs::read_to_string(&link).unwrap(), "new\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_write_atomic_keeps_mode() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dhcpcd.conf");
        std::fs::write(&path, "old\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o640)).unwrap();

        write_atomic(&path, b"new\n").await.unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o640);
    }

    #[tokio::test]
    async fn test_write_atomic_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("dhcpcd.conf");

        let err = write_atomic(&path, b"data").await.unwrap_err();
        assert!(matches!(err, NetkeeperError::Io { .. }));
    }
}
