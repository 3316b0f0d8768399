/// Render a serial as colon separated upper-case hex, e.g. `42 -> "2A"`,
/// `4660 -> "12:34"`, `2723 -> "0A:A3"`.
pub fn format_serial(serial: i64) -> String {
    let mut hex = format!("{:X}", serial);
    if hex.len() % 2 == 1 {
        hex.insert(0, '0');
    }
    hex.as_bytes()
        .chunks(2)
        .map(|pair| String::from_utf8_lossy(pair).into_owned())
        .collect::<Vec<_>>()
        .join(":")
}

/// Parse a serial given either as decimal or as (optionally colon separated) hex.
pub fn parse_serial(input: &str) -> Option<i64> {
    let trimmed = input.trim();
    if trimmed.contains(':') || trimmed.starts_with("0x") {
        let hex: String = trimmed
            .trim_start_matches("0x")
            .chars()
            .filter(|c| *c != ':')
            .collect();
        return i64::from_str_radix(&hex, 16).ok().filter(|v| *v >= 0);
    }
    trimmed.parse::<i64>().ok().filter(|v| *v >= 0)
}
