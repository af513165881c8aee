use anyhow::{Context, Result};
use ndarray::{ArrayD, IxDyn};
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::tensor::TensorElementType;
use ort::value::{Tensor, ValueType};

use crate::config::{check_input_shape, FeatureConfig, ModelConfig, OutputKind, Quantization};
use crate::error::{ClassifyError, ConfigError};
use crate::preprocessing::FeatureTensor;

/// One probability per class, in model output order. Sums to 1.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassProbabilities(Vec<f32>);

impl ClassProbabilities {
    /// Softmax over raw scores.
    pub fn from_logits(logits: &[f32]) -> Self {
        let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let exps: Vec<f32> = logits.iter().map(|&z| (z - max).exp()).collect();
        let sum: f32 = exps.iter().sum();
        Self(exps.into_iter().map(|e| e / sum).collect())
    }

    /// Scores that are already probabilities, renormalised to sum to 1.
    pub fn from_scores(scores: &[f32]) -> Self {
        let sum: f32 = scores.iter().map(|s| s.max(0.0)).sum();
        if sum > 0.0 {
            Self(scores.iter().map(|s| s.max(0.0) / sum).collect())
        } else {
            Self(vec![1.0 / scores.len() as f32; scores.len()])
        }
    }

    /// Winning class and its probability. Ties go to the lowest index.
    pub fn argmax(&self) -> Option<(usize, f32)> {
        self.0
            .iter()
            .copied()
            .enumerate()
            .fold(None, |best, (i, p)| match best {
                Some((_, bp)) if bp >= p => best,
                _ => Some((i, p)),
            })
    }

    pub fn values(&self) -> &[f32] {
        &self.0
    }
}

pub trait Classifier {
    fn classify(&mut self, features: &FeatureTensor) -> Result<ClassProbabilities, ClassifyError>;

    fn labels(&self) -> &[String];
}

/// Frozen (optionally int8-quantised) ONNX network, loaded once.
pub struct OnnxClassifier {
    session: Session,
    input_shape: Vec<usize>,
    labels: Vec<String>,
    output: OutputKind,
    input_quantization: Option<Quantization>,
    output_quantization: Option<Quantization>,
}

impl OnnxClassifier {
    /// Loads the model and verifies it against the feature configuration.
    /// Any mismatch is a [`ConfigError`].
    pub fn load(model: &ModelConfig, features: &FeatureConfig) -> Result<Self> {
        check_input_shape(&model.input_shape, features.bands(), features.frames)?;
        if model.labels.is_empty() {
            return Err(ConfigError::NoLabels.into());
        }

        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(1)?
            .with_inter_threads(1)?
            .commit_from_file(&model.path)
            .with_context(|| format!("Failed to load classifier model {}", model.path.display()))?;

        let input = Signature::first(session.inputs.first().map(|i| &i.input_type), "input")?;
        let output = Signature::first(session.outputs.first().map(|o| &o.output_type), "output")?;
        check_signature(&input, &output, model, features)?;

        let mut classifier = Self {
            session,
            input_shape: model.input_shape.clone(),
            labels: model.labels.clone(),
            output: model.output,
            input_quantization: model.input_quantization,
            output_quantization: model.output_quantization,
        };

        // Warm-up also catches class axes the model leaves dynamic
        let silence = FeatureTensor::zeros((features.bands(), features.frames));
        match classifier.classify(&silence) {
            Ok(_) => {}
            Err(ClassifyError::OutputLength { expected, got }) => {
                return Err(ConfigError::ClassCountMismatch { expected, got }.into())
            }
            Err(err) => return Err(anyhow::Error::new(err).context("Warm-up inference failed")),
        }

        Ok(classifier)
    }

    /// Raw model scores, dequantised but not normalised.
    fn infer(&mut self, features: &FeatureTensor) -> Result<Vec<f32>, ClassifyError> {
        let data: Vec<f32> = features.iter().copied().collect();
        let shape = IxDyn(&self.input_shape);

        let outputs = match self.input_quantization {
            Some(q) => {
                let quantized = data.iter().map(|&x| quantize(x, q)).collect();
                let tensor = Tensor::from_array(ArrayD::from_shape_vec(shape, quantized)?)?;
                self.session.run(ort::inputs![tensor])?
            }
            None => {
                let tensor = Tensor::from_array(ArrayD::from_shape_vec(shape, data)?)?;
                self.session.run(ort::inputs![tensor])?
            }
        };

        // Output may be [classes], [1, classes] or [1, 1, classes]
        let scores = match self.output_quantization {
            Some(q) => {
                let output: ndarray::ArrayViewD<i8> = outputs[0].try_extract_array()?;
                output.iter().map(|&v| dequantize(v, q)).collect()
            }
            None => {
                let output: ndarray::ArrayViewD<f32> = outputs[0].try_extract_array()?;
                output.iter().copied().collect()
            }
        };

        Ok(scores)
    }
}

impl Classifier for OnnxClassifier {
    fn classify(&mut self, features: &FeatureTensor) -> Result<ClassProbabilities, ClassifyError> {
        let scores = self.infer(features)?;

        if scores.len() != self.labels.len() {
            return Err(ClassifyError::OutputLength {
                expected: self.labels.len(),
                got: scores.len(),
            });
        }
        if scores.iter().any(|s| !s.is_finite()) {
            return Err(ClassifyError::NonFinite);
        }

        Ok(match self.output {
            OutputKind::Logits => ClassProbabilities::from_logits(&scores),
            OutputKind::Probabilities => ClassProbabilities::from_scores(&scores),
        })
    }

    fn labels(&self) -> &[String] {
        &self.labels
    }
}

/// Element type and dimensions a model declares for one tensor. Dynamic axes are `-1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub element: TensorElementType,
    pub dims: Vec<i64>,
}

impl Signature {
    fn first(value: Option<&ValueType>, tensor: &'static str) -> Result<Self, ConfigError> {
        match value.map(|v| (v.tensor_type(), v.tensor_shape())) {
            Some((Some(element), Some(shape))) => Ok(Self {
                element,
                dims: shape.to_vec(),
            }),
            _ => Err(ConfigError::NotATensor(tensor)),
        }
    }
}

/// The network's own declarations must agree with the configured input
/// shape, quantization and label count.
pub fn check_signature(
    input: &Signature,
    output: &Signature,
    model: &ModelConfig,
    features: &FeatureConfig,
) -> Result<(), ConfigError> {
    let fits = input.dims.len() == model.input_shape.len()
        && input
            .dims
            .iter()
            .zip(&model.input_shape)
            .all(|(&declared, &configured)| declared < 0 || declared as usize == configured);
    if !fits {
        return Err(ConfigError::ShapeMismatch {
            declared: input.dims.clone(),
            bands: features.bands(),
            frames: features.frames,
        });
    }

    let tensors = [
        ("input", input, model.input_quantization.is_some()),
        ("output", output, model.output_quantization.is_some()),
    ];
    for (tensor, signature, quantized) in tensors {
        let expected = if quantized {
            TensorElementType::Int8
        } else {
            TensorElementType::Float32
        };
        if signature.element != expected {
            return Err(ConfigError::ElementType {
                tensor,
                expected,
                found: signature.element,
            });
        }
    }

    // Unit axes aside, one axis of `labels.len()`; a dynamic axis is left to the warm-up
    let classes = model.labels.len();
    let known: Vec<i64> = output.dims.iter().copied().filter(|&d| d >= 0 && d != 1).collect();
    let dynamic = output.dims.iter().any(|&d| d < 0);
    let fits = match known.as_slice() {
        [] => dynamic || classes == 1,
        [n] => *n as usize == classes,
        _ => false,
    };
    if !fits {
        return Err(ConfigError::ClassCountMismatch {
            expected: classes,
            got: known.iter().product::<i64>() as usize,
        });
    }
    Ok(())
}

fn quantize(x: f32, q: Quantization) -> i8 {
    (x / q.scale + q.zero_point as f32)
        .round()
        .clamp(i8::MIN as f32, i8::MAX as f32) as i8
}

fn dequantize(v: i8, q: Quantization) -> f32 {
    (v as i32 - q.zero_point) as f32 * q.scale
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_softmax_sums_to_one() {
        let probs = ClassProbabilities::from_logits(&[2.0, 0.5, -1.0]);
        let sum: f32 = probs.values().iter().sum();
        assert!((sum - 1.0).abs() < 1e-6);
        assert_eq!(probs.argmax().map(|(i, _)| i), Some(0));
    }

    #[test]
    fn test_softmax_is_stable_for_large_logits() {
        let probs = ClassProbabilities::from_logits(&[1000.0, 999.0, -1000.0]);
        assert!(probs.values().iter().all(|p| p.is_finite()));
        let (index, p) = probs.argmax().unwrap();
        assert_eq!(index, 0);
        assert!((p - 0.7311).abs() < 1e-3);
    }

    #[test]
    fn test_scores_renormalised() {
        let probs = ClassProbabilities::from_scores(&[0.1, 0.1, 0.3]);
        let (index, p) = probs.argmax().unwrap();
        assert_eq!(index, 2);
        assert!((p - 0.6).abs() < 1e-6);

        let flat = ClassProbabilities::from_scores(&[0.0, 0.0]);
        assert_eq!(flat.values(), &[0.5, 0.5]);
    }

    #[test]
    fn test_argmax_tie_prefers_first() {
        let probs = ClassProbabilities(vec![0.4, 0.4, 0.2]);
        assert_eq!(probs.argmax(), Some((0, 0.4)));
        assert_eq!(ClassProbabilities(Vec::new()).argmax(), None);
    }

    #[test]
    fn test_int8_quantization() {
        let q = Quantization {
            scale: 1.0 / 255.0,
            zero_point: -128,
        };
        assert_eq!(quantize(0.0, q), -128);
        assert_eq!(quantize(1.0, q), 127);
        assert_eq!(quantize(5.0, q), 127);
        assert!((dequantize(127, q) - 1.0).abs() < 1e-6);
        assert_eq!(dequantize(-128, q), 0.0);
    }

    fn signature(element: TensorElementType, dims: &[i64]) -> Signature {
        Signature {
            element,
            dims: dims.to_vec(),
        }
    }

    const F32: TensorElementType = TensorElementType::Float32;
    const I8: TensorElementType = TensorElementType::Int8;

    #[test]
    fn test_signature_accepts_dynamic_axes() {
        let model = ModelConfig::default();
        let features = FeatureConfig::default();
        let input = signature(F32, &[-1, 1, 64, 64]);

        check_signature(&input, &signature(F32, &[1, 3]), &model, &features).unwrap();
        check_signature(&input, &signature(F32, &[-1, 3]), &model, &features).unwrap();
        check_signature(&input, &signature(F32, &[3]), &model, &features).unwrap();
        check_signature(&input, &signature(F32, &[1, -1]), &model, &features).unwrap();
    }

    #[test]
    fn test_signature_rejects_declared_input_shape() {
        let model = ModelConfig::default();
        let features = FeatureConfig::default();
        let output = signature(F32, &[1, 3]);

        for dims in [&[1, 1, 64, 32][..], &[1, 64, 64], &[1, 1, 64, 64, 1]] {
            let err = check_signature(&signature(F32, dims), &output, &model, &features).unwrap_err();
            assert!(matches!(err, ConfigError::ShapeMismatch { ref declared, .. } if declared == dims));
        }
    }

    #[test]
    fn test_signature_rejects_class_count() {
        let model = ModelConfig::default();
        let features = FeatureConfig::default();
        let input = signature(F32, &[1, 1, 64, 64]);

        for (dims, got) in [(&[1, 4][..], 4), (&[1, 1][..], 1), (&[2, 3][..], 6)] {
            let err = check_signature(&input, &signature(F32, dims), &model, &features).unwrap_err();
            assert!(matches!(err, ConfigError::ClassCountMismatch { expected: 3, got: g } if g == got));
        }
    }

    #[test]
    fn test_signature_element_types_follow_quantization() {
        let features = FeatureConfig::default();
        let q = Quantization {
            scale: 1.0 / 255.0,
            zero_point: -128,
        };

        // Int8 network without quantization configured
        let err = check_signature(
            &signature(I8, &[1, 1, 64, 64]),
            &signature(I8, &[1, 3]),
            &ModelConfig::default(),
            &features,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::ElementType { tensor: "input", found: I8, .. }));

        let model = ModelConfig {
            input_quantization: Some(q),
            output_quantization: Some(q),
            ..ModelConfig::default()
        };
        check_signature(&signature(I8, &[1, 1, 64, 64]), &signature(I8, &[1, 3]), &model, &features).unwrap();

        let err = check_signature(&signature(I8, &[1, 1, 64, 64]), &signature(F32, &[1, 3]), &model, &features)
            .unwrap_err();
        assert!(matches!(err, ConfigError::ElementType { tensor: "output", expected: I8, .. }));
    }

    #[test]
    fn test_load_rejects_shape_mismatch_before_touching_model() {
        let model = ModelConfig {
            path: "does/not/exist.onnx".into(),
            input_shape: vec![1, 1, 64, 32],
            ..ModelConfig::default()
        };
        let err = OnnxClassifier::load(&model, &FeatureConfig::default()).err().unwrap();
        assert!(matches!(
            err.downcast_ref::<ConfigError>(),
            Some(ConfigError::ShapeMismatch { .. })
        ));
    }
}
