//! Candidate port lists.
//!
//! Peers and the supervisor both work over a set of relay ports, given either
//! as an explicit list (`5000,5002,5004`) or a contiguous range (`5000-5003`,
//! or a base port plus an instance count).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error returned when a port specification cannot be parsed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid port specification '{input}': {reason}")]
pub struct PortSpecError {
    input: String,
    reason: &'static str,
}

impl PortSpecError {
    fn new(input: &str, reason: &'static str) -> Self {
        Self {
            input: input.to_string(),
            reason,
        }
    }
}

/// An ordered set of candidate ports
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum PortSpec {
    /// Explicit ports, tried in the given order
    List(Vec<u16>),
    /// `count` contiguous ports starting at `base`
    Range {
        /// First port
        base: u16,
        /// Number of ports
        count: u16,
    },
}

impl PortSpec {
    /// A single port
    #[must_use]
    pub fn single(port: u16) -> Self {
        PortSpec::List(vec![port])
    }

    /// `count` contiguous ports starting at `base`
    #[must_use]
    pub fn range(base: u16, count: u16) -> Self {
        PortSpec::Range { base, count }
    }

    /// Expand into the ordered candidate list.
    ///
    /// Ranges stop at port 65535 rather than wrapping.
    #[must_use]
    pub fn candidates(&self) -> Vec<u16> {
        match self {
            PortSpec::List(ports) => ports.clone(),
            PortSpec::Range { base, count } => (0..*count)
                .map_while(|offset| base.checked_add(offset))
                .collect(),
        }
    }

    /// Returns true if no candidate ports are configured
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            PortSpec::List(ports) => ports.is_empty(),
            PortSpec::Range { count, .. } => *count == 0,
        }
    }
}

/// Order candidates so the sticky index (if valid) comes first and the rest
/// follow in their original order. Each entry carries its original index.
#[must_use]
pub fn sticky_order(candidates: &[u16], sticky: Option<usize>) -> Vec<(usize, u16)> {
    let mut order = Vec::with_capacity(candidates.len());

    let sticky = sticky.filter(|&idx| idx < candidates.len());
    if let Some(idx) = sticky {
        order.push((idx, candidates[idx]));
    }

    order.extend(
        candidates
            .iter()
            .copied()
            .enumerate()
            .filter(|(idx, _)| Some(*idx) != sticky),
    );

    order
}

fn parse_port(input: &str, s: &str) -> Result<u16, PortSpecError> {
    let port: u16 = s
        .trim()
        .parse()
        .map_err(|_| PortSpecError::new(input, "not a port number"))?;
    if port == 0 {
        return Err(PortSpecError::new(input, "port 0 is not allowed"));
    }
    Ok(port)
}

impl FromStr for PortSpec {
    type Err = PortSpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(PortSpecError::new(s, "empty"));
        }

        if let Some((start, end)) = trimmed.split_once('-') {
            let start = parse_port(s, start)?;
            let end = parse_port(s, end)?;
            if end < start {
                return Err(PortSpecError::new(s, "range end is below range start"));
            }
            return Ok(PortSpec::Range {
                base: start,
                count: end - start + 1,
            });
        }

        let ports = trimmed
            .split(',')
            .map(|part| parse_port(s, part))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(PortSpec::List(ports))
    }
}

impl TryFrom<String> for PortSpec {
    type Error = PortSpecError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PortSpec> for String {
    fn from(spec: PortSpec) -> Self {
        spec.to_string()
    }
}

impl fmt::Display for PortSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortSpec::List(ports) => {
                let joined: Vec<String> = ports.iter().map(u16::to_string).collect();
                write!(f, "{}", joined.join(","))
            }
            PortSpec::Range { base, count } => {
                let last = base.saturating_add(count.saturating_sub(1));
                write!(f, "{base}-{last}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_single() {
        let spec: PortSpec = "5000".parse().unwrap();
        assert_eq!(spec, PortSpec::single(5000));
        assert_eq!(spec.candidates(), vec![5000]);
    }

    #[test]
    fn test_parse_list_and_range() {
        let list: PortSpec = "5000, 5002,5004".parse().unwrap();
        assert_eq!(list.candidates(), vec![5000, 5002, 5004]);

        let range: PortSpec = "5000-5003".parse().unwrap();
        assert_eq!(range, PortSpec::range(5000, 4));
        assert_eq!(range.candidates(), vec![5000, 5001, 5002, 5003]);
        assert_eq!(range.to_string(), "5000-5003");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("".parse::<PortSpec>().is_err());
        assert!("0".parse::<PortSpec>().is_err());
        assert!("5003-5000".parse::<PortSpec>().is_err());
        assert!("abc".parse::<PortSpec>().is_err());
        assert!("5000,,5001".parse::<PortSpec>().is_err());
    }

    #[test]
    fn test_range_stops_at_max_port() {
        let spec = PortSpec::range(65534, 5);
        assert_eq!(spec.candidates(), vec![65534, 65535]);
    }

    #[test]
    fn test_sticky_first() {
        let candidates = [5000, 5001, 5002];
        assert_eq!(
            sticky_order(&candidates, Some(2)),
            vec![(2, 5002), (0, 5000), (1, 5001)]
        );
        assert_eq!(
            sticky_order(&candidates, None),
            vec![(0, 5000), (1, 5001), (2, 5002)]
        );
    }

    #[test]
    fn test_sticky_out_of_range_ignored() {
        let candidates = [5000, 5001];
        assert_eq!(
            sticky_order(&candidates, Some(7)),
            vec![(0, 5000), (1, 5001)]
        );
    }
}
