//! Misc utilities.

/// Formats a size in bytes for logs.
///
/// Sizes below 1 KiB are reported exactly; everything else is rounded
/// to one decimal place of the appropriate binary unit.
pub fn pretty_bytes(num: u64) -> String {
    if num < 1 << 10 {
        return format!("{} B", num);
    }

    let mut num = num as f64;
    for (x, p) in "kMGTPE".chars().enumerate() {
        if num < f64::powi(2.0, (2 + x as i32) * 10) {
            num /= f64::powi(2.0, (1 + x as i32) * 10);
            return format!("{:.1} {}iB", num, p);
        }
    }

    // u64 can't exceed 16 EiB, so we never fall out of the loop
    unreachable!();
}

/// Formats a duration in seconds for logs.
pub fn pretty_deltat(seconds: f64) -> String {
    let seconds = if seconds < 0.0 { 0.0 } else { seconds };

    let hours = (seconds / 3600.0).floor() as u64;
    let minutes = ((seconds % 3600.0) / 60.0).floor() as u64;
    let secs = seconds % 60.0;

    if hours > 0 {
        format!("{}h {:02}m {:02}s", hours, minutes, secs.floor() as u64)
    } else if minutes > 0 {
        format!("{}m {:02}s", minutes, secs.floor() as u64)
    } else {
        format!("{:.1}s", secs)
    }
}
