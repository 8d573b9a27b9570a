use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Bundled demo recordings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Preset {
    Truck,
    ToneSweep,
    Symphony,
}

impl Preset {
    pub const ALL: [Preset; 3] = [Preset::Truck, Preset::ToneSweep, Preset::Symphony];

    pub fn key(&self) -> &'static str {
        match self {
            Preset::Truck => "truck",
            Preset::ToneSweep => "tone-sweep",
            Preset::Symphony => "symphony",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Preset::Truck => "Truck Driving",
            Preset::ToneSweep => "500Hz, 1kHz and 10kHz signals",
            Preset::Symphony => "Symphony no. 5 in Cm, Op. 67 - IV. Allegro",
        }
    }

    pub fn file_name(&self) -> &'static str {
        match self {
            Preset::Truck => "Truck_driving_by-Jason_Baker-2112866529.wav",
            Preset::ToneSweep => "500_1000_10000.wav",
            Preset::Symphony => "Symphony no. 5 in Cm, Op. 67 - IV. Allegro.mp3",
        }
    }

    /// Location of the preset file under `asset_dir`.
    pub fn url(&self, asset_dir: &Path) -> String {
        asset_dir.join(self.file_name()).to_string_lossy().into_owned()
    }
}

/// One entry of the source selector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceOption {
    Microphone,
    Preset(Preset),
    /// Any URL or file path
    Url(String),
}

impl SourceOption {
    pub fn label(&self) -> String {
        match self {
            SourceOption::Microphone => "Microphone".to_string(),
            SourceOption::Preset(preset) => preset.label().to_string(),
            SourceOption::Url(url) => url.clone(),
        }
    }
}

impl fmt::Display for SourceOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

impl FromStr for SourceOption {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err("empty source".to_string());
        }
        let lower = trimmed.to_ascii_lowercase();
        if lower == "mic" || lower == "microphone" {
            return Ok(SourceOption::Microphone);
        }
        if let Some(preset) = Preset::ALL.iter().find(|p| p.key() == lower) {
            return Ok(SourceOption::Preset(*preset));
        }
        Ok(SourceOption::Url(trimmed.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_parse_sources() {
        assert_eq!("mic".parse(), Ok(SourceOption::Microphone));
        assert_eq!(" Microphone ".parse(), Ok(SourceOption::Microphone));
        assert_eq!("tone-sweep".parse(), Ok(SourceOption::Preset(Preset::ToneSweep)));
        assert_eq!(
            "https://example.com/a.mp3".parse(),
            Ok(SourceOption::Url("https://example.com/a.mp3".to_string()))
        );
        assert!("  ".parse::<SourceOption>().is_err());
    }

    #[test]
    fn test_preset_urls_resolve_against_asset_dir() {
        let dir = PathBuf::from("/srv/audio");
        assert_eq!(Preset::Truck.url(&dir), "/srv/audio/Truck_driving_by-Jason_Baker-2112866529.wav");
        assert!(Preset::Symphony.url(&dir).ends_with(".mp3"));
    }

    #[test]
    fn test_labels() {
        assert_eq!(SourceOption::Preset(Preset::Truck).to_string(), "Truck Driving");
        assert_eq!(SourceOption::Microphone.label(), "Microphone");
    }
}
