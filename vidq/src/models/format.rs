//! Target container formats and output resolutions.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::JobError;

/// Container format of the transcoded output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoFormat {
    Mp4,
    Mkv,
    Avi,
    Mov,
}

impl VideoFormat {
    /// Every supported format, in display order.
    pub const ALL: [Self; 4] = [Self::Mp4, Self::Mkv, Self::Avi, Self::Mov];

    /// Label used on the wire, in the database and as the file suffix.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Mp4 => "mp4",
            Self::Mkv => "mkv",
            Self::Avi => "avi",
            Self::Mov => "mov",
        }
    }
}

impl FromStr for VideoFormat {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mp4" => Ok(Self::Mp4),
            "mkv" => Ok(Self::Mkv),
            "avi" => Ok(Self::Avi),
            "mov" => Ok(Self::Mov),
            _ => Err(JobError::validation(format!("unsupported video format: {s}"))),
        }
    }
}

impl std::fmt::Display for VideoFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Output frame size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Resolution {
    #[serde(rename = "480p")]
    Sd480,
    #[serde(rename = "720p")]
    Hd720,
    #[serde(rename = "1080p")]
    Fhd1080,
    #[serde(rename = "2160p")]
    Uhd2160,
}

impl Resolution {
    pub const ALL: [Self; 4] = [Self::Sd480, Self::Hd720, Self::Fhd1080, Self::Uhd2160];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sd480 => "480p",
            Self::Hd720 => "720p",
            Self::Fhd1080 => "1080p",
            Self::Uhd2160 => "2160p",
        }
    }

    /// Pixel dimensions passed to the transcoder's `-s` option.
    pub const fn dimensions(self) -> &'static str {
        match self {
            Self::Sd480 => "640x480",
            Self::Hd720 => "1280x720",
            Self::Fhd1080 => "1920x1080",
            Self::Uhd2160 => "3840x2160",
        }
    }

    /// Lenient parse: anything unrecognized falls back to 720p.
    pub fn from_label(label: &str) -> Self {
        label.parse().unwrap_or(Self::Hd720)
    }
}

impl FromStr for Resolution {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "480p" => Ok(Self::Sd480),
            "720p" => Ok(Self::Hd720),
            "1080p" => Ok(Self::Fhd1080),
            "2160p" => Ok(Self::Uhd2160),
            _ => Err(JobError::validation(format!(
                "unsupported video resolution: {s}"
            ))),
        }
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_parse() {
        assert_eq!("MKV".parse::<VideoFormat>().unwrap(), VideoFormat::Mkv);
        assert_eq!(" mov ".parse::<VideoFormat>().unwrap(), VideoFormat::Mov);
        assert!(matches!(
            "webm".parse::<VideoFormat>(),
            Err(JobError::Validation(_))
        ));
    }

    #[test]
    fn test_resolution_dimensions() {
        assert_eq!(Resolution::Sd480.dimensions(), "640x480");
        assert_eq!(Resolution::Hd720.dimensions(), "1280x720");
        assert_eq!(Resolution::Fhd1080.dimensions(), "1920x1080");
        assert_eq!(Resolution::Uhd2160.dimensions(), "3840x2160");
    }

    #[test]
    fn test_resolution_strict_and_lenient() {
        assert!("4k".parse::<Resolution>().is_err());
        assert_eq!(Resolution::from_label("4k"), Resolution::Hd720);
        assert_eq!(Resolution::from_label("1080p"), Resolution::Fhd1080);
    }

    #[test]
    fn test_serde_labels() {
        let json = serde_json::to_string(&Resolution::Uhd2160).unwrap();
        assert_eq!(json, "\"2160p\"");
        let format: VideoFormat = serde_json::from_str("\"avi\"").unwrap();
        assert_eq!(format, VideoFormat::Avi);
    }
}
