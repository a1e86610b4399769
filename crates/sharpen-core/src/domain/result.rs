use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AnalysisKind {
    ModelBased,
    ExternalReference,
    HalfDataset,
}

/// Immutable outcome of one scaling analysis. Assembled through
/// [`ScalingResultBuilder`] once every stage has completed; downstream
/// consumers (the sharpening applicator, the refinery's model-match target)
/// read it without ever mutating it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingResult {
    pub kind: AnalysisKind,
    pub resolution: f64,
    pub rmsd: Option<f64>,
    pub pseudo_likelihood: bool,
    /// One amplitude scale factor per resolution shell, binner order.
    pub target_scale_factors: Vec<f64>,
    /// Representative `(sin(θ)/λ)²` per shell.
    pub target_sthol2: Vec<f64>,
    /// High-resolution limit of each shell.
    pub d_min_list: Vec<f64>,
    /// Fitted (CC* or smoothed) correlation per shell.
    pub cc_list: Vec<f64>,
    /// RMS observed amplitude per shell.
    pub rms_fo_list: Vec<f64>,
    /// Mean of the first few low-resolution CC values.
    pub low_res_cc: f64,
    pub fraction_complete: f64,
    /// Exponential decay rate fitted to the CC curve, when requested.
    pub effective_b: Option<f64>,
    pub effective_b_f_obs: Option<f64>,
    pub b_zero: Option<f64>,
    pub fit_rms: Option<f64>,
}

impl ScalingResult {
    pub fn n_shells(&self) -> usize {
        self.target_scale_factors.len()
    }

    /// True when the analysis produced usable per-shell scale factors.
    pub fn has_scale_factors(&self) -> bool {
        !self.target_scale_factors.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct ScalingResultBuilder {
    kind: AnalysisKind,
    resolution: f64,
    rmsd: Option<f64>,
    pseudo_likelihood: bool,
    target_scale_factors: Vec<f64>,
    target_sthol2: Vec<f64>,
    d_min_list: Vec<f64>,
    cc_list: Vec<f64>,
    rms_fo_list: Vec<f64>,
    low_res_cc: f64,
    fraction_complete: f64,
    effective_b: Option<f64>,
    effective_b_f_obs: Option<f64>,
    b_zero: Option<f64>,
    fit_rms: Option<f64>,
}

impl ScalingResultBuilder {
    pub fn new(kind: AnalysisKind, resolution: f64) -> Self {
        Self {
            kind,
            resolution,
            rmsd: None,
            pseudo_likelihood: false,
            target_scale_factors: Vec::new(),
            target_sthol2: Vec::new(),
            d_min_list: Vec::new(),
            cc_list: Vec::new(),
            rms_fo_list: Vec::new(),
            low_res_cc: 0.0,
            fraction_complete: 1.0,
            effective_b: None,
            effective_b_f_obs: None,
            b_zero: None,
            fit_rms: None,
        }
    }

    pub fn rmsd(mut self, rmsd: Option<f64>) -> Self {
        self.rmsd = rmsd;
        self
    }

    pub fn pseudo_likelihood(mut self, pseudo_likelihood: bool) -> Self {
        self.pseudo_likelihood = pseudo_likelihood;
        self
    }

    pub fn shell_geometry(mut self, target_sthol2: Vec<f64>, d_min_list: Vec<f64>) -> Self {
        self.target_sthol2 = target_sthol2;
        self.d_min_list = d_min_list;
        self
    }

    pub fn correlation_curves(mut self, cc_list: Vec<f64>, rms_fo_list: Vec<f64>) -> Self {
        self.cc_list = cc_list;
        self.rms_fo_list = rms_fo_list;
        self
    }

    pub fn target_scale_factors(mut self, target_scale_factors: Vec<f64>) -> Self {
        self.target_scale_factors = target_scale_factors;
        self
    }

    pub fn low_res_cc(mut self, low_res_cc: f64) -> Self {
        self.low_res_cc = low_res_cc;
        self
    }

    pub fn fraction_complete(mut self, fraction_complete: f64) -> Self {
        self.fraction_complete = fraction_complete;
        self
    }

    pub fn effective_b_fit(
        mut self,
        effective_b: Option<f64>,
        effective_b_f_obs: Option<f64>,
        b_zero: Option<f64>,
        fit_rms: Option<f64>,
    ) -> Self {
        self.effective_b = effective_b;
        self.effective_b_f_obs = effective_b_f_obs;
        self.b_zero = b_zero;
        self.fit_rms = fit_rms;
        self
    }

    pub fn build(self) -> ScalingResult {
        ScalingResult {
            kind: self.kind,
            resolution: self.resolution,
            rmsd: self.rmsd,
            pseudo_likelihood: self.pseudo_likelihood,
            target_scale_factors: self.target_scale_factors,
            target_sthol2: self.target_sthol2,
            d_min_list: self.d_min_list,
            cc_list: self.cc_list,
            rms_fo_list: self.rms_fo_list,
            low_res_cc: self.low_res_cc,
            fraction_complete: self.fraction_complete,
            effective_b: self.effective_b,
            effective_b_f_obs: self.effective_b_f_obs,
            b_zero: self.b_zero,
            fit_rms: self.fit_rms,
        }
    }
}
