//! Resolution-shell binning of reflections.
//!
//! Shells are contiguous d-spacing ranges of roughly equal population,
//! ordered low to high resolution. The binner is built once per analysis
//! run and reused by every downstream computation sharing the binning.

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BinningError {
    #[error("shell count must be >= 1, got {n_bins}")]
    InvalidBinCount { n_bins: usize },
    #[error(
        "no data in shell {shell} of {n_bins}; please reduce the number of shells"
    )]
    EmptyShell { shell: usize, n_bins: usize },
    #[error("per-shell curve length mismatch: expected {expected}, got {actual}")]
    CurveLengthMismatch { expected: usize, actual: usize },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Shell {
    members: Vec<usize>,
    d_min: f64,
    d_max: f64,
    d_mean: f64,
}

impl Shell {
    pub fn members(&self) -> &[usize] {
        &self.members
    }

    pub fn population(&self) -> usize {
        self.members.len()
    }

    pub fn d_min(&self) -> f64 {
        self.d_min
    }

    pub fn d_max(&self) -> f64 {
        self.d_max
    }

    pub fn d_mean(&self) -> f64 {
        self.d_mean
    }

    /// `sin(θ)/λ)²` at the representative d-spacing of this shell.
    pub fn sthol2(&self) -> f64 {
        0.25 / (self.d_mean * self.d_mean)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolutionBinner {
    shells: Vec<Shell>,
    n_observations: usize,
}

impl ResolutionBinner {
    /// Partition observations into `n_bins` shells of roughly equal
    /// population, low resolution (large d) first. Every shell must end up
    /// with at least one member.
    pub fn setup(d_spacings: &[f64], n_bins: usize) -> Result<Self, BinningError> {
        if n_bins == 0 {
            return Err(BinningError::InvalidBinCount { n_bins });
        }

        let mut order: Vec<usize> = (0..d_spacings.len()).collect();
        order.sort_unstable_by(|lhs, rhs| {
            d_spacings[*rhs]
                .total_cmp(&d_spacings[*lhs])
                .then_with(|| lhs.cmp(rhs))
        });

        let base = d_spacings.len() / n_bins;
        let remainder = d_spacings.len() % n_bins;
        let mut shells = Vec::with_capacity(n_bins);
        let mut cursor = 0;
        for shell_index in 0..n_bins {
            let take = base + usize::from(shell_index < remainder);
            if take == 0 {
                return Err(BinningError::EmptyShell {
                    shell: shell_index + 1,
                    n_bins,
                });
            }
            let members: Vec<usize> = order[cursor..cursor + take].to_vec();
            cursor += take;

            let mut d_min = f64::INFINITY;
            let mut d_max = f64::NEG_INFINITY;
            let mut sum = 0.0;
            for &member in &members {
                let d = d_spacings[member];
                d_min = d_min.min(d);
                d_max = d_max.max(d);
                sum += d;
            }
            let d_mean = sum / members.len() as f64;
            shells.push(Shell {
                members,
                d_min,
                d_max,
                d_mean,
            });
        }

        Ok(Self {
            shells,
            n_observations: d_spacings.len(),
        })
    }

    pub fn n_bins(&self) -> usize {
        self.shells.len()
    }

    pub fn n_observations(&self) -> usize {
        self.n_observations
    }

    /// Shells in low-to-high-resolution order.
    pub fn shells(&self) -> &[Shell] {
        &self.shells
    }

    /// Observation indices belonging to shell `shell_index`.
    pub fn selection(&self, shell_index: usize) -> &[usize] {
        self.shells[shell_index].members()
    }

    pub fn selection_mask(&self, shell_index: usize) -> Vec<bool> {
        let mut mask = vec![false; self.n_observations];
        for &member in self.shells[shell_index].members() {
            mask[member] = true;
        }
        mask
    }

    /// Back-interpolate a per-shell curve onto every observation. The
    /// interpolation variable is `(1/d)^d_star_power`; values are blended
    /// linearly between adjacent shell centers and clamped at the outer
    /// centers (no extrapolation).
    pub fn interpolate(
        &self,
        per_shell: &[f64],
        d_spacings: &[f64],
        d_star_power: f64,
    ) -> Result<Vec<f64>, BinningError> {
        if per_shell.len() != self.shells.len() {
            return Err(BinningError::CurveLengthMismatch {
                expected: self.shells.len(),
                actual: per_shell.len(),
            });
        }
        if d_spacings.len() != self.n_observations {
            return Err(BinningError::CurveLengthMismatch {
                expected: self.n_observations,
                actual: d_spacings.len(),
            });
        }

        let centers: Vec<f64> = self
            .shells
            .iter()
            .map(|shell| (1.0 / shell.d_mean).powf(d_star_power))
            .collect();

        let mut interpolated = Vec::with_capacity(d_spacings.len());
        for &d in d_spacings {
            let x = (1.0 / d).powf(d_star_power);
            interpolated.push(interpolate_at(x, &centers, per_shell));
        }
        Ok(interpolated)
    }
}

fn interpolate_at(x: f64, centers: &[f64], values: &[f64]) -> f64 {
    if x <= centers[0] {
        return values[0];
    }
    let last = centers.len() - 1;
    if x >= centers[last] {
        return values[last];
    }
    let upper = centers
        .windows(2)
        .position(|window| x <= window[1])
        .map(|index| index + 1)
        .unwrap_or(last);
    let lower = upper - 1;
    let x0 = centers[lower];
    let x1 = centers[upper];
    if x1 == x0 {
        return values[upper];
    }
    let t = (x - x0) / (x1 - x0);
    values[lower] + t * (values[upper] - values[lower])
}
