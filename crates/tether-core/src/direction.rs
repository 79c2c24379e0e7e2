use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::CoreError;

/// Which half of a logical channel a socket serves.
///
/// A read endpoint has exactly one owner at a time, a write endpoint may be
/// shared by any number of senders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Read,
    Write,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Read => "read",
            Direction::Write => "write",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = CoreError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "read" => Ok(Direction::Read),
            "write" => Ok(Direction::Write),
            other => Err(CoreError::UnknownDirection(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Direction;
    use crate::CoreError;

    #[test]
    fn parses_known_directions() {
        assert_eq!("read".parse::<Direction>(), Ok(Direction::Read));
        assert_eq!("write".parse::<Direction>(), Ok(Direction::Write));
    }

    #[test]
    fn rejects_unknown_direction() {
        assert_eq!(
            "sideways".parse::<Direction>(),
            Err(CoreError::UnknownDirection("sideways".to_string()))
        );
    }
}
