use crate::types::{ClassError, ClassResult, LabelVector};
use ndarray::{Array2, ArrayView2, Axis, s};
use std::io::Write;
use std::process::Command;

/// Uniform contract a trained model must expose to the prediction
/// pipeline. Implemented by in-process models and by adapters around
/// external rule/committee runtimes.
pub trait Model: Send + Sync {
    /// Hard class codes (or regression values) for each feature row
    fn predict(&self, features: ArrayView2<f64>) -> ClassResult<LabelVector>;

    /// Per-class probabilities (rows x classes); only meaningful when the
    /// model family supports probabilities
    fn predict_proba(&self, features: ArrayView2<f64>) -> ClassResult<Array2<f32>> {
        let _ = features;
        Err(ClassError::Configuration(
            "Model does not produce class probabilities".to_string(),
        ))
    }

    /// Ordered class codes; probability column j corresponds to classes()[j]
    fn classes(&self) -> &[i32];

    /// Declared feature count, used for a pre-flight shape check
    fn n_features(&self) -> Option<usize> {
        None
    }

    /// True for regression-style models whose output is continuous
    fn is_regressor(&self) -> bool {
        false
    }
}

/// Model family tag, resolved from the user-facing model name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelFamily {
    /// Bagged/boosted tree ensembles with probability support
    TreeEnsemble,
    /// Kernel and decision-boundary classifiers (SVM-like)
    KernelBoundary,
    /// Rule/committee models executed by an external runtime
    RuleCommittee,
    /// Chain/grid structured models
    StructuredChain,
}

/// Capability descriptor consulted instead of branching on model names
#[derive(Debug, Clone, Copy)]
pub struct BackendDescriptor {
    pub family: ModelFamily,
    pub supports_probability: bool,
    pub supports_sample_weight: bool,
    pub valid_params: &'static [&'static str],
}

static TREE_ENSEMBLE: BackendDescriptor = BackendDescriptor {
    family: ModelFamily::TreeEnsemble,
    supports_probability: true,
    supports_sample_weight: true,
    valid_params: &["trees", "max_depth", "min_samples", "rand_vars"],
};

static KERNEL_BOUNDARY: BackendDescriptor = BackendDescriptor {
    family: ModelFamily::KernelBoundary,
    supports_probability: false,
    supports_sample_weight: true,
    valid_params: &["c", "gamma", "kernel"],
};

static RULE_COMMITTEE: BackendDescriptor = BackendDescriptor {
    family: ModelFamily::RuleCommittee,
    supports_probability: false,
    supports_sample_weight: false,
    valid_params: &["committees", "rules", "extrapolation"],
};

static STRUCTURED_CHAIN: BackendDescriptor = BackendDescriptor {
    family: ModelFamily::StructuredChain,
    supports_probability: true,
    supports_sample_weight: false,
    valid_params: &["iterations", "inference"],
};

impl ModelFamily {
    /// Resolve a user-facing model name to its family tag
    pub fn from_name(name: &str) -> ClassResult<ModelFamily> {
        match name.to_lowercase().as_str() {
            "rf" | "random-forest" | "extra-trees" | "gradient-boosting" | "bagging" => {
                Ok(ModelFamily::TreeEnsemble)
            }
            "svm" | "svm-linear" | "logistic" | "qda" => Ok(ModelFamily::KernelBoundary),
            "c5" | "cubist" => Ok(ModelFamily::RuleCommittee),
            "chain-crf" | "grid-crf" => Ok(ModelFamily::StructuredChain),
            other => Err(ClassError::Configuration(format!(
                "Unsupported model name: {}",
                other
            ))),
        }
    }

    pub fn descriptor(&self) -> &'static BackendDescriptor {
        match self {
            ModelFamily::TreeEnsemble => &TREE_ENSEMBLE,
            ModelFamily::KernelBoundary => &KERNEL_BOUNDARY,
            ModelFamily::RuleCommittee => &RULE_COMMITTEE,
            ModelFamily::StructuredChain => &STRUCTURED_CHAIN,
        }
    }

    /// Reject hyperparameters the family does not understand
    pub fn validate_params<'a, I: IntoIterator<Item = &'a str>>(
        &self,
        params: I,
    ) -> ClassResult<()> {
        let descriptor = self.descriptor();
        for param in params {
            if !descriptor.valid_params.contains(&param) {
                return Err(ClassError::Configuration(format!(
                    "Parameter '{}' is not valid for {:?} models",
                    param, self.descriptor().family
                )));
            }
        }
        Ok(())
    }
}

/// One prediction interface over the heterogeneous model families.
///
/// A tile's pixel range may be split into fixed-size chunks predicted
/// concurrently; chunk order is preserved when the results are
/// concatenated, so chunk i's predictions land exactly where chunk i's
/// input rows came from.
pub struct PredictionBackend {
    model: Box<dyn Model>,
    descriptor: &'static BackendDescriptor,
    chunk_rows: Option<usize>,
}

impl PredictionBackend {
    pub fn new(family: ModelFamily, model: Box<dyn Model>) -> Self {
        Self {
            model,
            descriptor: family.descriptor(),
            chunk_rows: None,
        }
    }

    /// Split tile pixels into chunks of this many rows and predict the
    /// chunks on the worker pool
    pub fn with_chunk_rows(mut self, chunk_rows: usize) -> ClassResult<Self> {
        if chunk_rows == 0 {
            return Err(ClassError::Configuration(
                "Prediction chunk size must be positive".to_string(),
            ));
        }
        self.chunk_rows = Some(chunk_rows);
        Ok(self)
    }

    pub fn descriptor(&self) -> &BackendDescriptor {
        self.descriptor
    }

    pub fn classes(&self) -> &[i32] {
        self.model.classes()
    }

    pub fn n_features(&self) -> Option<usize> {
        self.model.n_features()
    }

    pub fn is_regressor(&self) -> bool {
        self.model.is_regressor()
    }

    /// Fail fast when probability output is requested from a family that
    /// cannot provide it
    pub fn ensure_probability_support(&self) -> ClassResult<()> {
        if !self.descriptor.supports_probability {
            return Err(ClassError::Configuration(format!(
                "Probability output requested but {:?} models do not support it",
                self.descriptor.family
            )));
        }
        Ok(())
    }

    fn check_features(&self, features: &ArrayView2<f64>) -> ClassResult<()> {
        if let Some(expected) = self.model.n_features() {
            if features.ncols() != expected {
                return Err(ClassError::ShapeMismatch(format!(
                    "Model expects {} features, got {}",
                    expected,
                    features.ncols()
                )));
            }
        }
        Ok(())
    }

    fn chunk_bounds(&self, pixels: usize) -> Option<Vec<(usize, usize)>> {
        let chunk = self.chunk_rows?;
        if pixels <= chunk {
            return None;
        }
        Some(
            (0..pixels)
                .step_by(chunk)
                .map(|start| (start, (start + chunk).min(pixels)))
                .collect(),
        )
    }

    /// Hard labels for every feature row
    pub fn predict(&self, features: ArrayView2<f64>) -> ClassResult<LabelVector> {
        self.check_features(&features)?;
        let bounds = match self.chunk_bounds(features.nrows()) {
            None => return self.model.predict(features),
            Some(bounds) => bounds,
        };
        log::debug!("Predicting {} pixels in {} chunks", features.nrows(), bounds.len());

        let parts = self.map_chunks(features, &bounds, |view| self.model.predict(view))?;
        let mut out = LabelVector::zeros(features.nrows());
        for ((start, end), part) in bounds.into_iter().zip(parts) {
            if part.len() != end - start {
                return Err(ClassError::ShapeMismatch(format!(
                    "Chunk predicted {} labels for {} rows",
                    part.len(),
                    end - start
                )));
            }
            out.slice_mut(s![start..end]).assign(&part);
        }
        Ok(out)
    }

    /// Per-class probabilities for every feature row
    pub fn predict_proba(&self, features: ArrayView2<f64>) -> ClassResult<Array2<f32>> {
        self.ensure_probability_support()?;
        self.check_features(&features)?;
        let n_classes = self.model.classes().len();
        let bounds = match self.chunk_bounds(features.nrows()) {
            None => return self.model.predict_proba(features),
            Some(bounds) => bounds,
        };

        let parts = self.map_chunks(features, &bounds, |view| self.model.predict_proba(view))?;
        let mut out = Array2::zeros((features.nrows(), n_classes));
        for ((start, end), part) in bounds.into_iter().zip(parts) {
            if part.dim() != (end - start, n_classes) {
                return Err(ClassError::ShapeMismatch(format!(
                    "Chunk produced probability shape {:?}, expected ({}, {})",
                    part.dim(),
                    end - start,
                    n_classes
                )));
            }
            out.slice_mut(s![start..end, ..]).assign(&part);
        }
        Ok(out)
    }

    /// Run one closure per chunk on the worker pool. par_iter keeps result
    /// order aligned with chunk order.
    #[cfg(feature = "parallel")]
    fn map_chunks<T: Send, F>(
        &self,
        features: ArrayView2<f64>,
        bounds: &[(usize, usize)],
        f: F,
    ) -> ClassResult<Vec<T>>
    where
        F: Fn(ArrayView2<f64>) -> ClassResult<T> + Sync,
    {
        use rayon::prelude::*;
        bounds
            .par_iter()
            .map(|&(start, end)| f(features.slice(s![start..end, ..])))
            .collect()
    }

    #[cfg(not(feature = "parallel"))]
    fn map_chunks<T: Send, F>(
        &self,
        features: ArrayView2<f64>,
        bounds: &[(usize, usize)],
        f: F,
    ) -> ClassResult<Vec<T>>
    where
        F: Fn(ArrayView2<f64>) -> ClassResult<T> + Sync,
    {
        bounds
            .iter()
            .map(|&(start, end)| f(features.slice(s![start..end, ..])))
            .collect()
    }
}

/// Map probability-argmax column indices to real class codes. All-zero
/// probability rows (null pixels) map to label 0 rather than the first
/// class code.
pub fn labels_from_probabilities(
    probabilities: ArrayView2<f32>,
    classes: &[i32],
) -> ClassResult<LabelVector> {
    if probabilities.ncols() != classes.len() {
        return Err(ClassError::ShapeMismatch(format!(
            "{} probability columns for {} classes",
            probabilities.ncols(),
            classes.len()
        )));
    }
    let mut labels = LabelVector::zeros(probabilities.nrows());
    for (i, row) in probabilities.axis_iter(Axis(0)).enumerate() {
        let mut best = 0usize;
        let mut best_p = 0.0f32;
        for (j, &p) in row.iter().enumerate() {
            if p > best_p {
                best_p = p;
                best = j;
            }
        }
        labels[i] = if best_p > 0.0 { classes[best] as f32 } else { 0.0 };
    }
    Ok(labels)
}

/// External rule/committee runtime (C5/Cubist style): rows go out, flat
/// predictions come back
pub trait RuleRuntime: Send + Sync {
    fn predict_rows(&self, features: ArrayView2<f64>) -> ClassResult<LabelVector>;
}

/// Out-of-process runtime invoked once per row chunk. The chunk's feature
/// rows are marshalled to a temporary CSV file and the runtime's stdout is
/// parsed back as one prediction per row.
pub struct CommandRuntime {
    program: String,
}

impl CommandRuntime {
    /// Probe the runtime binary at construction time, so a missing
    /// installation surfaces before any tile is processed
    pub fn new(program: &str) -> ClassResult<Self> {
        Command::new(program)
            .arg("--version")
            .output()
            .map_err(|e| {
                ClassError::BackendUnavailable(format!(
                    "Rule runtime '{}' is not installed or not executable: {}",
                    program, e
                ))
            })?;
        Ok(Self {
            program: program.to_string(),
        })
    }
}

impl RuleRuntime for CommandRuntime {
    fn predict_rows(&self, features: ArrayView2<f64>) -> ClassResult<LabelVector> {
        let mut file = tempfile::NamedTempFile::new()?;
        for row in features.axis_iter(Axis(0)) {
            let line: Vec<String> = row.iter().map(|v| v.to_string()).collect();
            writeln!(file, "{}", line.join(","))?;
        }
        file.flush()?;

        let output = Command::new(&self.program)
            .arg("predict")
            .arg(file.path())
            .output()?;
        if !output.status.success() {
            return Err(ClassError::Processing(format!(
                "Rule runtime '{}' failed: {}",
                self.program,
                String::from_utf8_lossy(&output.stderr)
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let values: Vec<f32> = stdout
            .split_whitespace()
            .map(|tok| {
                tok.parse::<f32>().map_err(|e| {
                    ClassError::Processing(format!("Unparseable runtime output '{}': {}", tok, e))
                })
            })
            .collect::<ClassResult<_>>()?;
        if values.len() != features.nrows() {
            return Err(ClassError::ShapeMismatch(format!(
                "Runtime returned {} predictions for {} rows",
                values.len(),
                features.nrows()
            )));
        }
        Ok(LabelVector::from_vec(values))
    }
}

/// Model adapter around an external rule/committee runtime
pub struct RuleCommitteeModel {
    runtime: Box<dyn RuleRuntime>,
    classes: Vec<i32>,
    n_features: Option<usize>,
    chunk_rows: usize,
}

impl RuleCommitteeModel {
    pub fn new(runtime: Box<dyn RuleRuntime>, classes: Vec<i32>, n_features: Option<usize>) -> Self {
        Self {
            runtime,
            classes,
            n_features,
            chunk_rows: 50_000,
        }
    }

    pub fn with_chunk_rows(mut self, chunk_rows: usize) -> Self {
        self.chunk_rows = chunk_rows.max(1);
        self
    }
}

impl Model for RuleCommitteeModel {
    fn predict(&self, features: ArrayView2<f64>) -> ClassResult<LabelVector> {
        let pixels = features.nrows();
        let mut out = LabelVector::zeros(pixels);
        let mut start = 0;
        while start < pixels {
            let end = (start + self.chunk_rows).min(pixels);
            let part = self.runtime.predict_rows(features.slice(s![start..end, ..]))?;
            if part.len() != end - start {
                return Err(ClassError::ShapeMismatch(format!(
                    "Runtime chunk returned {} predictions for {} rows",
                    part.len(),
                    end - start
                )));
            }
            out.slice_mut(s![start..end]).assign(&part);
            start = end;
        }
        Ok(out)
    }

    fn classes(&self) -> &[i32] {
        &self.classes
    }

    fn n_features(&self) -> Option<usize> {
        self.n_features
    }
}
