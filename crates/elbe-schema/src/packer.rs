use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Post-processing applied to a produced artifact before it is handed out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackerKind {
    #[default]
    None,
    Gzip,
    Zstd,
    Tar,
    TarXz,
    TarGz,
    TarZstd,
}

impl PackerKind {
    pub const ALL: [PackerKind; 7] = [
        PackerKind::None,
        PackerKind::Gzip,
        PackerKind::Zstd,
        PackerKind::Tar,
        PackerKind::TarXz,
        PackerKind::TarGz,
        PackerKind::TarZstd,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Gzip => "gzip",
            Self::Zstd => "zstd",
            Self::Tar => "tar",
            Self::TarXz => "tarxz",
            Self::TarGz => "targz",
            Self::TarZstd => "tarzstd",
        }
    }

    /// Suffix appended to the packed file name.
    pub fn suffix(self) -> &'static str {
        match self {
            Self::None => "",
            Self::Gzip => ".gz",
            Self::Zstd => ".zst",
            Self::Tar => ".tar",
            Self::TarXz => ".tar.xz",
            Self::TarGz => ".tar.gz",
            Self::TarZstd => ".tar.zst",
        }
    }
}

impl fmt::Display for PackerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PackerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| {
                let known: Vec<&str> = Self::ALL.iter().map(|p| p.as_str()).collect();
                format!("unknown packer '{s}', expected one of: {}", known.join(", "))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_name_parses_back() {
        for p in PackerKind::ALL {
            assert_eq!(p.as_str().parse::<PackerKind>().unwrap(), p);
        }
    }

    #[test]
    fn unknown_name_lists_alternatives() {
        let err = "bzip2".parse::<PackerKind>().unwrap_err();
        assert!(err.contains("bzip2"));
        assert!(err.contains("targz"));
    }

    #[test]
    fn none_has_no_suffix() {
        assert_eq!(PackerKind::None.suffix(), "");
        assert_eq!(PackerKind::TarZstd.suffix(), ".tar.zst");
    }

    #[test]
    fn deserializes_lowercase_names() {
        #[derive(Deserialize)]
        struct Wrap {
            packer: PackerKind,
        }
        let w: Wrap = toml::from_str("packer = \"tarxz\"").unwrap();
        assert_eq!(w.packer, PackerKind::TarXz);
    }
}
