use anyhow::{ensure, Context, Result};
use std::{collections::BTreeSet, num::NonZeroU16};

/// An ordered set of ports.
///
/// Ordering keeps every list derived from it (and so every patch) stable across requests.
pub type PortSet = BTreeSet<NonZeroU16>;

/// Parses an exclusion list such as `6060,7000-7002` into the set of ports it names.
///
/// Blank entries are ignored, so an empty string yields an empty set.
pub fn parse_portset(s: &str) -> Result<PortSet> {
    let mut ports = PortSet::new();
    for entry in s.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (first, last) = match entry.split_once('-') {
            Some((first, last)) => (parse_port(first)?, parse_port(last)?),
            None => {
                let port = parse_port(entry)?;
                (port, port)
            }
        };
        ensure!(first <= last, "invalid port range {entry:?}");
        ports.extend((first.get()..=last.get()).filter_map(NonZeroU16::new));
    }
    Ok(ports)
}

/// Formats sorted ports as an exclusion list, collapsing consecutive ports into ranges.
///
/// The output uses the syntax [`parse_portset`] reads, so `1-65535` stays `1-65535`.
pub fn format_portset(ports: &[NonZeroU16]) -> String {
    let mut ranges: Vec<(u16, u16)> = Vec::new();
    for port in ports.iter().map(|p| p.get()) {
        match ranges.last_mut() {
            Some((_, last)) if last.checked_add(1) == Some(port) => *last = port,
            Some((_, last)) if *last == port => {}
            _ => ranges.push((port, port)),
        }
    }

    ranges
        .into_iter()
        .map(|(first, last)| {
            if first == last {
                first.to_string()
            } else {
                format!("{first}-{last}")
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

fn parse_port(s: &str) -> Result<NonZeroU16> {
    s.trim()
        .parse()
        .with_context(|| format!("invalid port {s:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(ports: &[u16]) -> PortSet {
        ports.iter().copied().filter_map(NonZeroU16::new).collect()
    }

    #[test]
    fn parses_ports_and_ranges() {
        assert!(parse_portset("").unwrap().is_empty());
        assert!(parse_portset(" , ").unwrap().is_empty());
        assert_eq!(parse_portset("1").unwrap(), set(&[1]));
        assert_eq!(parse_portset("7000-7002").unwrap(), set(&[7000, 7001, 7002]));
        assert_eq!(parse_portset("8080, 1-2").unwrap(), set(&[1, 2, 8080]));
        assert_eq!(parse_portset("6060,6060").unwrap(), set(&[6060]));
    }

    #[test]
    fn formats_runs_as_ranges() {
        let fmt = |ports: &[u16]| format_portset(&set(ports).into_iter().collect::<Vec<_>>());
        assert_eq!(fmt(&[]), "");
        assert_eq!(fmt(&[6060, 8080]), "6060,8080");
        assert_eq!(fmt(&[6060, 7000, 7001, 7002, 8080]), "6060,7000-7002,8080");
        assert_eq!(fmt(&[65534, 65535]), "65534-65535");

        let all = parse_portset("1-65535").unwrap().into_iter().collect::<Vec<_>>();
        assert_eq!(format_portset(&all), "1-65535");
    }

    #[test]
    fn formatted_lists_parse_back() {
        let ports = parse_portset("80, 443, 8000-8080, 9090").unwrap();
        let formatted = format_portset(&ports.iter().copied().collect::<Vec<_>>());
        assert_eq!(formatted, "80,443,8000-8080,9090");
        assert_eq!(parse_portset(&formatted).unwrap(), ports);
    }

    #[test]
    fn rejects_invalid_ports() {
        for invalid in ["0", "2-1", "2-", "-2", "65536", "http"] {
            assert!(parse_portset(invalid).is_err(), "{invalid:?}");
        }
    }
}
