//! HDR to SDR tone mapping
//!
//! The scanout of an HDR desktop is PQ-encoded Rec.2020 (SMPTE ST.2084).
//! Bringing it down to an 8-bit sRGB raster takes a per-pixel pipeline:
//! PQ decode to cd/m², gamut conversion to Rec.709, normalization to a
//! scene-referred range, exposure, a selectable tone curve, and sRGB
//! encoding.
//!
//! The GPU runs this pipeline as a compute shader
//! (`capture/shaders/hdr_tonemap.comp`); this module holds the operator
//! selection types shared with the shader's push constants and a CPU
//! implementation of the same math used as the numerical reference.
//!
//! Supported curves:
//! - Reinhard and extended Reinhard
//! - ACES approximations (Narkowicz, Hill, Day) and the full RRT fit
//! - Hable (Uncharted 2)
//! - Uchimura (Gran Turismo)

use crate::error::{CaptureError, Result};

/// Tone mapping curve selection
///
/// The discriminants match the `mode` push constant consumed by the
/// compute shader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u32)]
pub enum ToneMapOperator {
    /// Simple Reinhard, `x / (x + 1)`
    Reinhard = 0,
    /// ACES rational fit by Krzysztof Narkowicz
    AcesNarkowicz = 1,
    /// ACES RRT+ODT fit by Stephen Hill
    #[default]
    AcesHill = 2,
    /// Pre-exposed ACES rational ("day" variant)
    AcesDay = 3,
    /// Full ACES RRT approximation with glow and red modifier
    AcesFullRrt = 4,
    /// Hable / Uncharted 2 filmic curve
    Hable = 5,
    /// Extended Reinhard with a fixed white point
    ReinhardExtended = 6,
    /// Uchimura / Gran Turismo curve
    Uchimura = 7,
}

impl ToneMapOperator {
    /// All operators in mode order
    pub const ALL: [ToneMapOperator; 8] = [
        ToneMapOperator::Reinhard,
        ToneMapOperator::AcesNarkowicz,
        ToneMapOperator::AcesHill,
        ToneMapOperator::AcesDay,
        ToneMapOperator::AcesFullRrt,
        ToneMapOperator::Hable,
        ToneMapOperator::ReinhardExtended,
        ToneMapOperator::Uchimura,
    ];

    /// Look up an operator by its numeric mode
    pub fn from_mode(mode: u32) -> Result<Self> {
        Self::ALL
            .get(mode as usize)
            .copied()
            .ok_or_else(|| CaptureError::unsupported(format!("tone mapping mode {mode} (0-7)")))
    }

    /// Numeric mode passed to the shader
    pub fn mode(self) -> u32 {
        self as u32
    }

    /// Display luminance in cd/m² that maps to scene-referred 1.0
    ///
    /// Empirical per-curve factors tuned for HDR10 scanouts peaking near
    /// 1000 cd/m²; content mastered darker will appear dim.
    pub fn normalization_nits(self) -> f32 {
        match self {
            ToneMapOperator::Reinhard => 100.0,
            ToneMapOperator::AcesNarkowicz => 80.0,
            ToneMapOperator::AcesHill => 80.0,
            ToneMapOperator::AcesDay => 80.0,
            ToneMapOperator::AcesFullRrt => 80.0,
            ToneMapOperator::Hable => 200.0,
            ToneMapOperator::ReinhardExtended => 120.0,
            ToneMapOperator::Uchimura => 400.0,
        }
    }
}

impl std::fmt::Display for ToneMapOperator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ToneMapOperator::Reinhard => write!(f, "Reinhard"),
            ToneMapOperator::AcesNarkowicz => write!(f, "ACES Narkowicz"),
            ToneMapOperator::AcesHill => write!(f, "ACES Hill"),
            ToneMapOperator::AcesDay => write!(f, "ACES Day"),
            ToneMapOperator::AcesFullRrt => write!(f, "ACES Full RRT"),
            ToneMapOperator::Hable => write!(f, "Hable"),
            ToneMapOperator::ReinhardExtended => write!(f, "Reinhard Extended"),
            ToneMapOperator::Uchimura => write!(f, "Uchimura"),
        }
    }
}

impl std::str::FromStr for ToneMapOperator {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if let Ok(mode) = s.parse::<u32>() {
            return Self::from_mode(mode).map_err(|e| e.to_string());
        }
        match s.to_lowercase().as_str() {
            "reinhard" => Ok(ToneMapOperator::Reinhard),
            "narkowicz" | "aces-narkowicz" | "aces-fast" => Ok(ToneMapOperator::AcesNarkowicz),
            "aces" | "hill" | "aces-hill" => Ok(ToneMapOperator::AcesHill),
            "aces-day" => Ok(ToneMapOperator::AcesDay),
            "aces-full" | "full-rrt" => Ok(ToneMapOperator::AcesFullRrt),
            "hable" | "uncharted2" | "filmic" => Ok(ToneMapOperator::Hable),
            "reinhard-extended" | "reinhard-ext" => Ok(ToneMapOperator::ReinhardExtended),
            "uchimura" | "gt" => Ok(ToneMapOperator::Uchimura),
            _ => Err(format!("Unknown tone mapping operator: {}", s)),
        }
    }
}

/// Tone mapping parameters, mirrored into the shader push constants
#[derive(Debug, Clone, Copy)]
pub struct ToneMapSettings {
    /// Exposure multiplier applied in scene-referred space, must be > 0
    pub exposure: f32,
    /// Selected curve
    pub operator: ToneMapOperator,
}

impl Default for ToneMapSettings {
    fn default() -> Self {
        Self {
            exposure: 1.0,
            operator: ToneMapOperator::default(),
        }
    }
}

/// Run the full per-pixel pipeline on one PQ-encoded Rec.2020 sample
///
/// Input channels are PQ signal values in [0, 1]; the result is
/// sRGB-encoded Rec.709 in [0, 1]. This is the reference for the compute
/// shader's numerical contracts.
pub fn map_pq_rec2020(pq_rgb: [f32; 3], settings: &ToneMapSettings) -> [f32; 3] {
    let nits = pq_rgb.map(|c| pq_eotf(c.clamp(0.0, 1.0)));
    let rec709 = mat3_mul_vec3(&REC2020_TO_REC709, nits);

    let scale = settings.exposure / settings.operator.normalization_nits();
    let scene = rec709.map(|c| c * scale);

    let mapped = apply_operator(settings.operator, scene);
    mapped.map(|c| srgb_encode(c.clamp(0.0, 1.0)))
}

/// Apply the selected tone curve to scene-referred linear Rec.709
pub fn apply_operator(op: ToneMapOperator, rgb: [f32; 3]) -> [f32; 3] {
    match op {
        ToneMapOperator::Reinhard => rgb.map(reinhard),
        ToneMapOperator::AcesNarkowicz => aces_narkowicz(rgb),
        ToneMapOperator::AcesHill => aces_hill(rgb),
        ToneMapOperator::AcesDay => aces_day(rgb),
        ToneMapOperator::AcesFullRrt => aces_full_rrt(rgb),
        ToneMapOperator::Hable => rgb.map(hable),
        ToneMapOperator::ReinhardExtended => rgb.map(reinhard_extended),
        ToneMapOperator::Uchimura => rgb.map(uchimura),
    }
}

// ============================================================================
// Transfer functions
// ============================================================================

/// PQ (ST 2084) constants
const PQ_M1: f64 = 0.1593017578125;
const PQ_M2: f64 = 78.84375;
const PQ_C1: f64 = 0.8359375;
const PQ_C2: f64 = 18.8515625;
const PQ_C3: f64 = 18.6875;

/// PQ EOTF: signal in [0, 1] to display luminance in cd/m² (0..10000)
pub fn pq_eotf(signal: f32) -> f32 {
    let x = f64::from(signal.clamp(0.0, 1.0));
    if x <= 0.0 {
        return 0.0;
    }
    let p = x.powf(1.0 / PQ_M2);
    let num = (p - PQ_C1).max(0.0);
    let den = (PQ_C2 - PQ_C3 * p).max(1e-7);
    ((num / den).powf(1.0 / PQ_M1) * 10000.0) as f32
}

/// PQ inverse EOTF: display luminance in cd/m² back to signal in [0, 1]
pub fn pq_inv_eotf(nits: f32) -> f32 {
    let y = (f64::from(nits) / 10000.0).clamp(0.0, 1.0);
    let yp = y.powf(PQ_M1);
    let num = PQ_C1 + PQ_C2 * yp;
    let den = 1.0 + PQ_C3 * yp;
    (num / den).powf(PQ_M2) as f32
}

/// sRGB encode (linear to gamma)
pub fn srgb_encode(x: f32) -> f32 {
    let x = x.max(0.0);
    if x <= 0.0031308 {
        12.92 * x
    } else {
        1.055 * x.powf(1.0 / 2.4) - 0.055
    }
}

/// sRGB decode (gamma to linear)
pub fn srgb_decode(x: f32) -> f32 {
    let x = x.max(0.0);
    if x <= 0.04045 {
        x / 12.92
    } else {
        ((x + 0.055) / 1.055).powf(2.4)
    }
}

// ============================================================================
// Color matrices
//
// Derived from double-precision primaries so each pair round-trips; the
// 3x3 arrays are row-major.
// ============================================================================

pub const REC2020_TO_REC709: [[f32; 3]; 3] = [
    [1.6604910, -0.5876411, -0.0728499],
    [-0.1245505, 1.1328999, -0.0083494],
    [-0.0181508, -0.1005789, 1.1187297],
];

pub const REC709_TO_REC2020: [[f32; 3]; 3] = [
    [0.6274039, 0.3292830, 0.0433131],
    [0.0690973, 0.9195404, 0.0113623],
    [0.0163914, 0.0880133, 0.8955953],
];

pub const REC709_TO_AP1: [[f32; 3]; 3] = [
    [0.6130973, 0.3395229, 0.0473793],
    [0.0701942, 0.9163556, 0.0134501],
    [0.0206156, 0.1095698, 0.8698151],
];

pub const AP1_TO_REC709: [[f32; 3]; 3] = [
    [1.7050510, -0.6217921, -0.0832588],
    [-0.1302564, 1.1408047, -0.0105483],
    [-0.0240034, -0.1289690, 1.1529737],
];

pub const AP0_TO_AP1: [[f32; 3]; 3] = [
    [1.4514393, -0.2365107, -0.2149286],
    [-0.0765538, 1.1762297, -0.0996759],
    [0.0083161, -0.0060324, 0.9977163],
];

pub const AP1_TO_AP0: [[f32; 3]; 3] = [
    [0.6954522, 0.1406787, 0.1638691],
    [0.0447946, 0.8596711, 0.0955343],
    [-0.0055259, 0.0040252, 1.0015007],
];

/// Rec.709 luma weights
pub const LUMA_709: [f32; 3] = [0.2126729, 0.7151522, 0.0721750];

pub fn mat3_mul_vec3(m: &[[f32; 3]; 3], v: [f32; 3]) -> [f32; 3] {
    [
        m[0][0] * v[0] + m[0][1] * v[1] + m[0][2] * v[2],
        m[1][0] * v[0] + m[1][1] * v[1] + m[1][2] * v[2],
        m[2][0] * v[0] + m[2][1] * v[1] + m[2][2] * v[2],
    ]
}

pub fn mat3_mul(a: &[[f32; 3]; 3], b: &[[f32; 3]; 3]) -> [[f32; 3]; 3] {
    let mut out = [[0.0f32; 3]; 3];
    for (i, row) in out.iter_mut().enumerate() {
        for (j, cell) in row.iter_mut().enumerate() {
            *cell = a[i][0] * b[0][j] + a[i][1] * b[1][j] + a[i][2] * b[2][j];
        }
    }
    out
}

/// Relative luminance with Rec.709 weights
pub fn luminance(rgb: [f32; 3]) -> f32 {
    LUMA_709[0] * rgb[0] + LUMA_709[1] * rgb[1] + LUMA_709[2] * rgb[2]
}

/// Saturation as channel spread over the maximum, guarded against zero
pub fn saturation(rgb: [f32; 3]) -> f32 {
    let max = rgb[0].max(rgb[1]).max(rgb[2]);
    let min = rgb[0].min(rgb[1]).min(rgb[2]);
    (max - min) / max.max(0.01)
}

/// `pow` with the base clamped to zero
fn pow_safe(base: f32, exp: f32) -> f32 {
    base.max(0.0).powf(exp)
}

fn smoothstep(e0: f32, e1: f32, x: f32) -> f32 {
    let t = ((x - e0) / (e1 - e0)).clamp(0.0, 1.0);
    t * t * (3.0 - 2.0 * t)
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

// ============================================================================
// Tone curve operators
//
// Each maps non-negative scene-referred values into [0, 1].
// ============================================================================

/// Reinhard, `x / (x + 1)`
pub fn reinhard(x: f32) -> f32 {
    x / (1.0 + x)
}

/// Extended Reinhard with white point 4
pub fn reinhard_extended(x: f32) -> f32 {
    const WHITE: f32 = 4.0;
    ((x * (1.0 + x / (WHITE * WHITE))) / (1.0 + x)).clamp(0.0, 1.0)
}

/// Uncharted 2 curve component
fn hable_partial(x: f32) -> f32 {
    const A: f32 = 0.15; // Shoulder strength
    const B: f32 = 0.50; // Linear strength
    const C: f32 = 0.10; // Linear angle
    const D: f32 = 0.20; // Toe strength
    const E: f32 = 0.02; // Toe numerator
    const F: f32 = 0.30; // Toe denominator

    ((x * (A * x + C * B) + D * E) / (x * (A * x + B) + D * F)) - E / F
}

/// Hable/Uncharted 2 filmic curve, normalized at W = 11.2
pub fn hable(x: f32) -> f32 {
    const EXPOSURE_BIAS: f32 = 2.0;
    const WHITE_POINT: f32 = 11.2;

    (hable_partial(x * EXPOSURE_BIAS) / hable_partial(WHITE_POINT)).clamp(0.0, 1.0)
}

/// Uchimura / Gran Turismo curve with
/// (P, a, m, l, c, b) = (1, 1, 0.22, 0.4, 1.33, 0)
pub fn uchimura(x: f32) -> f32 {
    const P: f32 = 1.0; // Max display brightness
    const A: f32 = 1.0; // Contrast
    const M: f32 = 0.22; // Linear section start
    const L: f32 = 0.4; // Linear section length
    const C: f32 = 1.33; // Black tightness
    const B: f32 = 0.0; // Pedestal

    let l0 = ((P - M) * L) / A;
    let s0 = M + l0;
    let s1 = M + A * l0;
    let c2 = (A * P) / (P - s1);
    let cp = -c2 / P;

    let w0 = 1.0 - smoothstep(0.0, M, x);
    let w2 = if x < M + l0 { 0.0 } else { 1.0 };
    let w1 = 1.0 - w0 - w2;

    let toe = M * pow_safe(x / M, C) + B;
    let shoulder = P - (P - s1) * (cp * (x - s0)).exp();
    let linear = M + A * (x - M);

    toe * w0 + linear * w1 + shoulder * w2
}

/// Narkowicz rational fit applied in AP1
pub fn aces_narkowicz(rgb: [f32; 3]) -> [f32; 3] {
    let ap1 = mat3_mul_vec3(&REC709_TO_AP1, rgb);
    let fit = ap1.map(narkowicz_curve);
    mat3_mul_vec3(&AP1_TO_REC709, fit).map(|c| c.clamp(0.0, 1.0))
}

fn narkowicz_curve(x: f32) -> f32 {
    ((x * (2.51 * x + 0.03)) / (x * (2.43 * x + 0.59) + 0.14)).clamp(0.0, 1.0)
}

/// Stephen Hill's RRT+ODT rational fit applied in AP1
pub fn aces_hill(rgb: [f32; 3]) -> [f32; 3] {
    let ap1 = mat3_mul_vec3(&REC709_TO_AP1, rgb);
    let fit = ap1.map(|x| {
        (x * (x + 0.0245786) - 0.000090537) / (x * (0.983729 * x + 0.4329510) + 0.238081)
    });
    mat3_mul_vec3(&AP1_TO_REC709, fit).map(|c| c.clamp(0.0, 1.0))
}

/// Narkowicz fit with a 0.6 pre-exposure, the "day" balance
pub fn aces_day(rgb: [f32; 3]) -> [f32; 3] {
    let ap1 = mat3_mul_vec3(&REC709_TO_AP1, rgb);
    let fit = ap1.map(|x| narkowicz_curve(0.6 * x));
    mat3_mul_vec3(&AP1_TO_REC709, fit).map(|c| c.clamp(0.0, 1.0))
}

/// Full RRT approximation: gamut clamp through AP0, glow, red modifier,
/// global tone scale, highlight desaturation
pub fn aces_full_rrt(rgb: [f32; 3]) -> [f32; 3] {
    const GLOW_GAIN: f32 = 0.05;
    const RED_HUE: f32 = 15.0;
    const RED_WIDTH: f32 = 60.0;
    const RED_PIVOT: f32 = 0.03;
    const RED_SCALE: f32 = 0.82;

    let ap1 = mat3_mul_vec3(&REC709_TO_AP1, rgb);
    let ap0 = mat3_mul_vec3(&AP1_TO_AP0, ap1).map(|c| c.max(0.0));
    let mut aces = mat3_mul_vec3(&AP0_TO_AP1, ap0).map(|c| c.max(0.0));

    // Glow module
    let sat = saturation(aces);
    let s = sigmoid((sat - 0.4) / 0.2);
    let glow = 1.0 + GLOW_GAIN * s;
    aces = aces.map(|c| c * glow);

    // Hue-shaped red modifier
    let centered = center_hue(rgb_to_hue(aces), RED_HUE);
    let hue_weight = {
        let w = smoothstep(0.0, 1.0, 1.0 - centered.abs() / RED_WIDTH);
        w * w
    };
    aces[0] += hue_weight * sat * (RED_PIVOT - aces[0]) * (1.0 - RED_SCALE);

    // Global tone scale
    let toned = aces.map(|x| {
        (x * (278.5085 * x + 10.7772)) / (x * (293.6045 * x + 88.7122) + 80.6889)
    });

    // Desaturate toward luminance as brightness rises from 0.18 to 2.0
    let lum = luminance(toned);
    let blend = ((lum - 0.18) / (2.0 - 0.18)).clamp(0.0, 1.0);
    let desat = [
        toned[0] + (lum - toned[0]) * blend,
        toned[1] + (lum - toned[1]) * blend,
        toned[2] + (lum - toned[2]) * blend,
    ];

    mat3_mul_vec3(&AP1_TO_REC709, desat).map(|c| c.clamp(0.0, 1.0))
}

/// Hue angle in degrees, 0 at red
fn rgb_to_hue(rgb: [f32; 3]) -> f32 {
    if rgb[0] == rgb[1] && rgb[1] == rgb[2] {
        return 0.0;
    }
    let hue = (3.0f32.sqrt() * (rgb[1] - rgb[2]))
        .atan2(2.0 * rgb[0] - rgb[1] - rgb[2])
        .to_degrees();
    if hue < 0.0 {
        hue + 360.0
    } else {
        hue
    }
}

/// Signed distance from `center`, wrapped to [-180, 180)
fn center_hue(hue: f32, center: f32) -> f32 {
    let mut centered = hue - center;
    if centered < -180.0 {
        centered += 360.0;
    } else if centered >= 180.0 {
        centered -= 360.0;
    }
    centered
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn frobenius_distance(a: &[[f32; 3]; 3], b: &[[f32; 3]; 3]) -> f32 {
        let mut sum = 0.0f32;
        for i in 0..3 {
            for j in 0..3 {
                let d = a[i][j] - b[i][j];
                sum += d * d;
            }
        }
        sum.sqrt()
    }

    const IDENTITY: [[f32; 3]; 3] = [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]];

    #[test]
    fn test_operator_from_mode() {
        assert_eq!(
            ToneMapOperator::from_mode(0).unwrap(),
            ToneMapOperator::Reinhard
        );
        assert_eq!(
            ToneMapOperator::from_mode(7).unwrap(),
            ToneMapOperator::Uchimura
        );
        assert!(ToneMapOperator::from_mode(8).is_err());
        for (mode, op) in ToneMapOperator::ALL.iter().enumerate() {
            assert_eq!(op.mode(), mode as u32);
        }
    }

    #[test]
    fn test_operator_from_str() {
        assert_eq!(
            "reinhard".parse::<ToneMapOperator>().unwrap(),
            ToneMapOperator::Reinhard
        );
        assert_eq!(
            "aces".parse::<ToneMapOperator>().unwrap(),
            ToneMapOperator::AcesHill
        );
        assert_eq!(
            "5".parse::<ToneMapOperator>().unwrap(),
            ToneMapOperator::Hable
        );
        assert!("9".parse::<ToneMapOperator>().is_err());
        assert!("invalid".parse::<ToneMapOperator>().is_err());
    }

    #[test]
    fn test_normalization_factors() {
        let factors: Vec<f32> = ToneMapOperator::ALL
            .iter()
            .map(|op| op.normalization_nits())
            .collect();
        assert_eq!(
            factors,
            [100.0, 80.0, 80.0, 80.0, 80.0, 200.0, 120.0, 400.0]
        );
    }

    #[test]
    fn test_pq_eotf_endpoints() {
        assert_eq!(pq_eotf(0.0), 0.0);
        // Full-scale PQ is the 10000 cd/m² peak
        assert!((pq_eotf(1.0) - 10000.0).abs() < 1.0);
    }

    #[test]
    fn test_pq_inverse_of_forward() {
        // Inverse within 1e-4 relative error over [0.01, 1.0]
        for i in 1..=100 {
            let signal = i as f32 / 100.0;
            let roundtrip = pq_inv_eotf(pq_eotf(signal));
            let rel = (roundtrip - signal).abs() / signal;
            assert!(
                rel <= 1e-4,
                "PQ roundtrip at {signal}: got {roundtrip}, rel err {rel}"
            );
        }
    }

    #[test]
    fn test_pq_roundtrip_sample_points() {
        for signal in [0.0f32, 0.1, 0.5, 0.9, 1.0] {
            let roundtrip = pq_inv_eotf(pq_eotf(signal));
            assert!(
                (roundtrip - signal).abs() <= 1e-3,
                "PQ roundtrip at {signal}: got {roundtrip}"
            );
        }
    }

    #[test]
    fn test_matrix_roundtrips() {
        let pairs = [
            (&REC2020_TO_REC709, &REC709_TO_REC2020),
            (&REC709_TO_AP1, &AP1_TO_REC709),
            (&AP0_TO_AP1, &AP1_TO_AP0),
        ];
        for (a, b) in pairs {
            assert!(frobenius_distance(&mat3_mul(a, b), &IDENTITY) < 1e-4);
            assert!(frobenius_distance(&mat3_mul(b, a), &IDENTITY) < 1e-4);
        }
    }

    #[test]
    fn test_matrices_preserve_white() {
        // Equal-energy white must stay white through a gamut conversion
        let white = mat3_mul_vec3(&REC2020_TO_REC709, [1.0, 1.0, 1.0]);
        for c in white {
            assert!((c - 1.0).abs() < 1e-3);
        }
    }

    #[test]
    fn test_srgb_roundtrip_all_bytes() {
        for i in 0..=255u32 {
            let x = i as f32 / 255.0;
            assert!((srgb_decode(srgb_encode(x)) - x).abs() <= 1.0 / 255.0);
            assert!((srgb_encode(srgb_decode(x)) - x).abs() <= 1.0 / 255.0);
        }
    }

    #[test]
    fn test_scalar_curves_monotone() {
        // Modes 0, 5, 6, 7 are monotone non-decreasing per channel
        for op in [
            ToneMapOperator::Reinhard,
            ToneMapOperator::Hable,
            ToneMapOperator::ReinhardExtended,
            ToneMapOperator::Uchimura,
        ] {
            let mut prev = f32::NEG_INFINITY;
            for i in 0..=4000 {
                let x = i as f32 * 0.01;
                let y = apply_operator(op, [x, x, x])[0];
                assert!(
                    y >= prev - 1e-6,
                    "{op} not monotone at {x}: {y} < {prev}"
                );
                prev = y;
            }
        }
    }

    #[test]
    fn test_curves_bounded() {
        for op in ToneMapOperator::ALL {
            for x in [0.0f32, 0.01, 0.18, 1.0, 4.0, 50.0, 1000.0] {
                let out = apply_operator(op, [x, x, x]);
                for c in out {
                    assert!(
                        (0.0..=1.0 + 1e-3).contains(&c),
                        "{op} out of range at {x}: {c}"
                    );
                }
            }
        }
    }

    #[test]
    fn test_reinhard_known_values() {
        assert_eq!(reinhard(0.0), 0.0);
        assert!((reinhard(1.0) - 0.5).abs() < 1e-6);
        assert!(reinhard(100.0) > 0.99);
    }

    #[test]
    fn test_hable_normalized_at_white() {
        // The curve reaches 1.0 at half the white point because of the
        // 2x exposure bias
        assert!((hable(5.6) - 1.0).abs() < 1e-3);
    }

    #[test]
    fn test_uchimura_linear_section() {
        // Inside the linear window the curve is the identity slope
        assert!((uchimura(0.3) - 0.3).abs() < 1e-3);
    }

    #[test]
    fn test_full_pipeline_peak_white() {
        // A full-scale PQ sample must survive the pipeline as a bright,
        // non-clipped-to-zero pixel for the simple Reinhard curve
        let settings = ToneMapSettings {
            exposure: 1.0,
            operator: ToneMapOperator::Reinhard,
        };
        let out = map_pq_rec2020([1.0, 1.0, 1.0], &settings);
        for c in out {
            assert!(c > 0.0 && c <= 1.0);
            assert!((c * 255.0) > 128.0, "peak white should stay bright");
        }
    }

    #[test]
    fn test_full_pipeline_black() {
        let out = map_pq_rec2020([0.0, 0.0, 0.0], &ToneMapSettings::default());
        assert_eq!(out, [0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_exposure_scales_brightness() {
        let dim = map_pq_rec2020(
            [0.5, 0.5, 0.5],
            &ToneMapSettings {
                exposure: 0.5,
                operator: ToneMapOperator::Reinhard,
            },
        );
        let bright = map_pq_rec2020(
            [0.5, 0.5, 0.5],
            &ToneMapSettings {
                exposure: 2.0,
                operator: ToneMapOperator::Reinhard,
            },
        );
        assert!(bright[0] > dim[0]);
    }

    #[test]
    fn test_saturation_guard() {
        assert_eq!(saturation([0.0, 0.0, 0.0]), 0.0);
        assert!((saturation([1.0, 0.0, 0.0]) - 1.0).abs() < 1e-6);
    }
}
