pub mod errors;
pub mod result;

pub use errors::{DomainError, DomainResult};
pub use result::{AnalysisKind, ScalingResult, ScalingResultBuilder};

use num_complex::Complex64;
use serde::{Deserialize, Serialize};

/// Reciprocal-lattice index of one reflection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MillerIndex(pub [i32; 3]);

/// Phase-separated map coefficients: one amplitude, phase (degrees) and
/// d-spacing per reflection. Immutable once constructed; transformations
/// produce new instances.
#[derive(Debug, Clone, PartialEq)]
pub struct MapCoefficients {
    indices: Vec<MillerIndex>,
    amplitudes: Vec<f64>,
    phases_deg: Vec<f64>,
    d_spacings: Vec<f64>,
}

impl MapCoefficients {
    pub fn new(
        indices: Vec<MillerIndex>,
        amplitudes: Vec<f64>,
        phases_deg: Vec<f64>,
        d_spacings: Vec<f64>,
    ) -> DomainResult<Self> {
        let expected = indices.len();
        if amplitudes.len() != expected {
            return Err(DomainError::LengthMismatch {
                field: "amplitudes",
                expected,
                actual: amplitudes.len(),
            });
        }
        if phases_deg.len() != expected {
            return Err(DomainError::LengthMismatch {
                field: "phases_deg",
                expected,
                actual: phases_deg.len(),
            });
        }
        if d_spacings.len() != expected {
            return Err(DomainError::LengthMismatch {
                field: "d_spacings",
                expected,
                actual: d_spacings.len(),
            });
        }
        for (index, value) in d_spacings.iter().copied().enumerate() {
            if !value.is_finite() || value <= 0.0 {
                return Err(DomainError::InvalidDSpacing { index, value });
            }
        }
        for (index, value) in amplitudes.iter().copied().enumerate() {
            if !value.is_finite() || value < 0.0 {
                return Err(DomainError::InvalidAmplitude { index, value });
            }
        }

        Ok(Self {
            indices,
            amplitudes,
            phases_deg,
            d_spacings,
        })
    }

    pub fn from_complex(
        indices: Vec<MillerIndex>,
        values: &[Complex64],
        d_spacings: Vec<f64>,
    ) -> DomainResult<Self> {
        let amplitudes = values.iter().map(|value| value.norm()).collect();
        let phases_deg = values.iter().map(|v| v.arg().to_degrees()).collect();
        Self::new(indices, amplitudes, phases_deg, d_spacings)
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn indices(&self) -> &[MillerIndex] {
        &self.indices
    }

    pub fn amplitudes(&self) -> &[f64] {
        &self.amplitudes
    }

    pub fn phases_deg(&self) -> &[f64] {
        &self.phases_deg
    }

    pub fn d_spacings(&self) -> &[f64] {
        &self.d_spacings
    }

    /// `sin(θ)/λ)² = 0.25/d²` per reflection.
    pub fn sthol2(&self) -> Vec<f64> {
        self.d_spacings.iter().map(|d| 0.25 / (d * d)).collect()
    }

    /// `1/d` per reflection.
    pub fn d_star(&self) -> Vec<f64> {
        self.d_spacings.iter().map(|d| 1.0 / d).collect()
    }

    pub fn complex_value(&self, index: usize) -> Complex64 {
        Complex64::from_polar(self.amplitudes[index], self.phases_deg[index].to_radians())
    }

    pub fn complex_values(&self) -> Vec<Complex64> {
        (0..self.len()).map(|i| self.complex_value(i)).collect()
    }

    /// Re-attach the existing phases to a new amplitude array
    /// (the phase-transfer operation).
    pub fn with_amplitudes(&self, amplitudes: Vec<f64>) -> DomainResult<Self> {
        Self::new(
            self.indices.clone(),
            amplitudes,
            self.phases_deg.clone(),
            self.d_spacings.clone(),
        )
    }

    /// Multiply amplitudes by a per-reflection scale array.
    pub fn scaled_by(&self, scales: &[f64]) -> DomainResult<Self> {
        if scales.len() != self.len() {
            return Err(DomainError::LengthMismatch {
                field: "scales",
                expected: self.len(),
                actual: scales.len(),
            });
        }
        let amplitudes = self
            .amplitudes
            .iter()
            .zip(scales)
            .map(|(a, s)| a * s)
            .collect();
        self.with_amplitudes(amplitudes)
    }
}

/// Opaque unit-cell geometry: only the orthogonalization matrix is needed,
/// to place reciprocal-space vectors on the nearest lattice point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UnitCellView {
    orthogonalization: [[f64; 3]; 3],
}

impl UnitCellView {
    pub fn from_orthogonalization(orthogonalization: [[f64; 3]; 3]) -> Self {
        Self { orthogonalization }
    }

    pub fn orthorhombic(a: f64, b: f64, c: f64) -> Self {
        Self {
            orthogonalization: [[a, 0.0, 0.0], [0.0, b, 0.0], [0.0, 0.0, c]],
        }
    }

    pub fn nearest_lattice_point(&self, reciprocal: [f64; 3]) -> MillerIndex {
        let mut rounded = [0i32; 3];
        for (row, target) in rounded.iter_mut().enumerate() {
            let mut value = 0.0;
            for col in 0..3 {
                value += self.orthogonalization[row][col] * reciprocal[col];
            }
            *target = value.round() as i32;
        }
        MillerIndex(rounded)
    }
}

/// Unit vector in reciprocal space used for anisotropy-aware analyses.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DirectionVector(pub [f64; 3]);

impl DirectionVector {
    pub fn normalized(x: f64, y: f64, z: f64) -> DomainResult<Self> {
        let norm = (x * x + y * y + z * z).sqrt();
        if norm == 0.0 || !norm.is_finite() {
            return Err(DomainError::ZeroDirectionVector { x, y, z });
        }
        Ok(Self([x / norm, y / norm, z / norm]))
    }

    pub fn dot(&self, other: [f64; 3]) -> f64 {
        self.0[0] * other[0] + self.0[1] * other[1] + self.0[2] * other[2]
    }

    pub fn scaled(&self, factor: f64) -> [f64; 3] {
        [self.0[0] * factor, self.0[1] * factor, self.0[2] * factor]
    }
}

/// Three-parameter piecewise-linear B-factor model `[b1, b2, b3]`.
/// `b1` applies midway to the nominal resolution, `b2` at the nominal
/// resolution, and `b3` is an increment past `b2` at the high-resolution
/// limit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BFactorModel(pub [f64; 3]);

impl BFactorModel {
    pub const ZERO: Self = Self([0.0, 0.0, 0.0]);

    pub fn b1(&self) -> f64 {
        self.0[0]
    }

    pub fn b2(&self) -> f64 {
        self.0[1]
    }

    pub fn b3(&self) -> f64 {
        self.0[2]
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }

    pub fn from_slice(values: &[f64]) -> Self {
        Self([values[0], values[1], values[2]])
    }
}

/// Which reference the observed coefficients are correlated against.
/// Chosen once at estimator construction.
#[derive(Debug, Clone)]
pub enum ReferenceSource {
    ModelBased { model: MapCoefficients },
    ExternalReference { reference: MapCoefficients },
    HalfDatasets {
        first: MapCoefficients,
        second: MapCoefficients,
    },
}

impl ReferenceSource {
    pub fn kind(&self) -> AnalysisKind {
        match self {
            Self::ModelBased { .. } => AnalysisKind::ModelBased,
            Self::ExternalReference { .. } => AnalysisKind::ExternalReference,
            Self::HalfDatasets { .. } => AnalysisKind::HalfDataset,
        }
    }
}

/// Real-space density grid produced by a Fourier-synthesis collaborator.
#[derive(Debug, Clone, PartialEq)]
pub struct RealSpaceMap {
    pub data: Vec<f64>,
    pub shape: [usize; 3],
}

/// Fourier synthesis collaborator: map coefficients to a real-space grid.
pub trait MapSynthesis {
    fn synthesize(&self, coefficients: &MapCoefficients, shape: [usize; 3]) -> RealSpaceMap;
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SurfaceAreaParams {
    pub solvent_fraction: f64,
    pub region_weight: f64,
    pub sa_percent: f64,
    pub fraction_occupied: f64,
    pub max_regions_to_test: usize,
    pub wrapping: bool,
}

impl Default for SurfaceAreaParams {
    fn default() -> Self {
        Self {
            solvent_fraction: 0.5,
            region_weight: 20.0,
            sa_percent: 30.0,
            fraction_occupied: 0.2,
            max_regions_to_test: 30,
            wrapping: false,
        }
    }
}

/// Solvent-flatness / adjusted-surface-area scoring collaborator.
pub trait SurfaceAreaScorer {
    fn adjusted_surface_area(&self, map: &RealSpaceMap, params: &SurfaceAreaParams) -> f64;
}
