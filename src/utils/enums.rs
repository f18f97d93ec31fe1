use serde::{Deserialize, Serialize};

/// Photometric bands of the deep stacks, in the order the fused catalog
/// lays them out.
#[derive(
    clap::ValueEnum, Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
pub enum Band {
    #[serde(rename = "g")]
    G,
    #[serde(rename = "r")]
    R,
    #[serde(rename = "i")]
    I,
    #[serde(rename = "z")]
    Z,
}

impl Band {
    pub const ALL: [Band; 4] = [Band::G, Band::R, Band::I, Band::Z];

    pub fn as_str(&self) -> &'static str {
        match self {
            Band::G => "g",
            Band::R => "r",
            Band::I => "i",
            Band::Z => "z",
        }
    }

    /// Capitalised name, as used in the reference catalog column suffixes.
    pub fn upper(&self) -> &'static str {
        match self {
            Band::G => "G",
            Band::R => "R",
            Band::I => "I",
            Band::Z => "Z",
        }
    }

    /// Position of the band in [`Band::ALL`].
    pub fn index(&self) -> usize {
        match self {
            Band::G => 0,
            Band::R => 1,
            Band::I => 2,
            Band::Z => 3,
        }
    }
}

impl std::fmt::Display for Band {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Band {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "g" | "G" => Ok(Band::G),
            "r" | "R" => Ok(Band::R),
            "i" | "I" => Ok(Band::I),
            "z" | "Z" => Ok(Band::Z),
            other => Err(format!("unknown band '{}'", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_band_names() {
        assert_eq!(Band::G.as_str(), "g");
        assert_eq!(Band::Z.upper(), "Z");
        assert_eq!("i".parse::<Band>().unwrap(), Band::I);
        assert_eq!("R".parse::<Band>().unwrap(), Band::R);
        assert!("y".parse::<Band>().is_err());
        for (i, band) in Band::ALL.iter().enumerate() {
            assert_eq!(band.index(), i);
        }
    }
}
