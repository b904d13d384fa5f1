use colored::*;

pub fn print_error(message: &str) {
    eprintln!("{prefix} {message}", prefix = "Error:".red().bold());
}

pub fn print_success(message: &str) {
    eprintln!("{prefix} {message}", prefix = "✓".green().bold());
}

pub fn print_warning(message: &str) {
    eprintln!("{prefix} {message}", prefix = "⚠".yellow().bold());
}

pub fn print_info(message: &str) {
    eprintln!("{prefix} {message}", prefix = "ℹ".blue().bold());
}

/// Signal strength bucket for a received RSSI
pub fn signal_label(rssi: Option<i16>) -> ColoredString {
    match rssi {
        Some(r) if r >= -60 => format!("{r} dBm").green(),
        Some(r) if r >= -80 => format!("{r} dBm").yellow(),
        Some(r) => format!("{r} dBm").red(),
        None => "unknown".dimmed(),
    }
}
