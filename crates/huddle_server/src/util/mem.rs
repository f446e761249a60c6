#![forbid(unsafe_code)]

/// Resident set size of this process in bytes, when the platform exposes it.
///
/// Reads `/proc/self/statm` (field 2, pages). Non-Linux platforms report
/// `None` and the janitor's memory watch stays inert.
#[cfg(target_os = "linux")]
pub fn process_rss_bytes() -> Option<u64> {
	let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
	let rss_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
	// Page size is 4 KiB on every Linux target we ship to.
	Some(rss_pages * 4096)
}

#[cfg(not(target_os = "linux"))]
pub fn process_rss_bytes() -> Option<u64> {
	None
}
