use serde::{Deserialize, Serialize};
use std::fmt;

/// Bandas del ecualizador de Lavalink (25 Hz .. 16 kHz)
pub const EQ_BANDS: usize = 15;

/// Rango de ganancia aceptado por el nodo para una banda
pub const MIN_GAIN: f32 = -0.25;
pub const MAX_GAIN: f32 = 1.0;

/// Una entrada del arreglo `filters.equalizer` del nodo
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EqBand {
    pub band: u8,
    pub gain: f32,
}

/// Preset de ecualizador
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EqPreset {
    Flat,
    Soft,
    Enhanced,
    BassBoost,
    VocalBoost,
    TrebleCut,
}

impl EqPreset {
    pub const ALL: [EqPreset; 6] = [
        EqPreset::Flat,
        EqPreset::Soft,
        EqPreset::Enhanced,
        EqPreset::BassBoost,
        EqPreset::VocalBoost,
        EqPreset::TrebleCut,
    ];

    /// Obtiene un preset por nombre
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "flat" | "normal" => Some(Self::Flat),
            "soft" => Some(Self::Soft),
            "enhanced" => Some(Self::Enhanced),
            "bass-boost" | "bass" => Some(Self::BassBoost),
            "vocal-boost" | "vocal" => Some(Self::VocalBoost),
            "treble-cut" => Some(Self::TrebleCut),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Flat => "flat",
            Self::Soft => "soft",
            Self::Enhanced => "enhanced",
            Self::BassBoost => "bass-boost",
            Self::VocalBoost => "vocal-boost",
            Self::TrebleCut => "treble-cut",
        }
    }

    pub fn gains(self) -> [f32; EQ_BANDS] {
        match self {
            Self::Flat => [0.0; EQ_BANDS],
            Self::Soft => [-0.05; EQ_BANDS],
            Self::Enhanced => [
                0.10, 0.15, 0.20, 0.10, 0.05, 0.00, 0.00, 0.05, 0.10, 0.05, 0.10, 0.15, 0.10, 0.05,
                0.00,
            ],
            Self::BassBoost => [
                0.30, 0.25, 0.20, 0.10, 0.05, 0.00, 0.00, 0.00, 0.00, 0.00, -0.02, -0.04, -0.05,
                -0.05, -0.05,
            ],
            Self::VocalBoost => [
                -0.05, -0.05, -0.02, 0.00, 0.10, 0.15, 0.18, 0.15, 0.10, 0.05, 0.00, -0.02, -0.02,
                -0.03, -0.03,
            ],
            Self::TrebleCut => [
                0.00, 0.00, 0.00, 0.00, 0.00, -0.05, -0.08, -0.10, -0.12, -0.15, -0.18, -0.20,
                -0.20, -0.20, -0.20,
            ],
        }
    }

    /// Bandas como las espera el nodo, con ganancias acotadas
    pub fn bands(self) -> Vec<EqBand> {
        self.gains()
            .iter()
            .enumerate()
            .map(|(band, &gain)| EqBand {
                band: band as u8,
                gain: gain.clamp(MIN_GAIN, MAX_GAIN),
            })
            .collect()
    }
}

impl fmt::Display for EqPreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
