use candle_core::{Module, ModuleT, Result, Tensor};
use candle_nn::{batch_norm, conv2d, BatchNorm, Conv2d, Conv2dConfig, VarBuilder};

/// Two-layer 1×1 convolution projection from the student's image space to
/// the teacher's text space: `conv → batch norm → ReLU → conv`.
///
/// Each feature vector is treated as a single spatial position.
#[derive(Debug, Clone)]
pub struct FeatureTranslator {
    conv_in: Conv2d,
    norm: BatchNorm,
    conv_out: Conv2d,
    in_dim: usize,
    out_dim: usize,
}

impl FeatureTranslator {
    pub fn new(vb: VarBuilder, in_dim: usize, out_dim: usize) -> Result<Self> {
        let vb = vb.pp("conv1");
        let cfg = Conv2dConfig::default();
        Ok(Self {
            conv_in: conv2d(in_dim, out_dim, 1, cfg, vb.pp("0"))?,
            norm: batch_norm(out_dim, 1e-5, vb.pp("1"))?,
            conv_out: conv2d(out_dim, out_dim, 1, cfg, vb.pp("3"))?,
            in_dim,
            out_dim,
        })
    }

    pub fn in_dim(&self) -> usize {
        self.in_dim
    }

    pub fn out_dim(&self) -> usize {
        self.out_dim
    }
}

impl ModuleT for FeatureTranslator {
    /// `(b, in_dim)` → `(b, out_dim)`. `train` selects batch statistics and
    /// updates the running estimates.
    fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let x = x.unsqueeze(2)?.unsqueeze(3)?;
        let x = self.conv_in.forward(&x)?;
        let x = self.norm.forward_t(&x, train)?.relu()?;
        self.conv_out.forward(&x)?.squeeze(3)?.squeeze(2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn build() -> (FeatureTranslator, VarMap) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        (FeatureTranslator::new(vb, 16, 24).unwrap(), varmap)
    }

    #[test]
    fn test_maps_dimensions() {
        let (tr, _) = build();
        let x = Tensor::randn(0f32, 1.0, (4, 16), &Device::Cpu).unwrap();
        assert_eq!(tr.forward_t(&x, true).unwrap().dims(), &[4, 24]);
        assert_eq!(tr.forward_t(&x, false).unwrap().dims(), &[4, 24]);
    }

    #[test]
    fn test_parameter_names() {
        let (_, varmap) = build();
        let data = varmap.data().lock().unwrap();
        for key in ["conv1.0.weight", "conv1.0.bias", "conv1.1.weight", "conv1.1.running_mean", "conv1.3.weight"] {
            assert!(data.contains_key(key), "missing {key}");
        }
    }

    #[test]
    fn test_training_updates_running_stats() {
        let (tr, varmap) = build();
        let before = varmap.data().lock().unwrap()["conv1.1.running_mean"].as_tensor().sum_all().unwrap();
        let x = (Tensor::randn(0f32, 1.0, (8, 16), &Device::Cpu).unwrap() + 3.0).unwrap();
        tr.forward_t(&x, true).unwrap();
        let after = varmap.data().lock().unwrap()["conv1.1.running_mean"].as_tensor().sum_all().unwrap();
        assert_ne!(before.to_scalar::<f32>().unwrap(), after.to_scalar::<f32>().unwrap());
    }
}
