use std::fs;
use std::io;
use std::path::Path;
use std::path::PathBuf;

/// Write a timestamped diagnostic dump under `dir`: the dumping thread's
/// backtrace plus the process status and thread list from /proc.
pub fn dump(dir: &Path) -> io::Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let timestamp = chrono::Utc::now().format("%Y%m%d%H%M%S");
    let path = dir.join(format!("stack_{timestamp}.txt"));

    let mut out = String::new();
    out.push_str(&format!(
        "memslice diagnostic dump at {}\n\n",
        chrono::Utc::now().to_rfc3339()
    ));
    out.push_str("=== backtrace (dumping thread) ===\n");
    out.push_str(&format!("{}\n", std::backtrace::Backtrace::force_capture()));

    if let Ok(status) = fs::read_to_string("/proc/self/status") {
        out.push_str("\n=== process status ===\n");
        out.push_str(&status);
    }
    if let Ok(tasks) = fs::read_dir("/proc/self/task") {
        out.push_str("\n=== threads ===\n");
        for task in tasks.flatten() {
            let tid = task.file_name().to_string_lossy().into_owned();
            let comm = fs::read_to_string(task.path().join("comm")).unwrap_or_default();
            out.push_str(&format!("{tid} {}\n", comm.trim_end()));
        }
    }

    fs::write(&path, out)?;
    tracing::info!("wrote diagnostic dump to {}", path.display());
    Ok(path)
}
