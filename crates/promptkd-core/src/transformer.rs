//! Pre-norm residual attention blocks shared by both CLIP towers.
//!
//! Weight names follow the Hugging Face CLIP layout
//! (`layer_norm1`, `self_attn.{q,k,v,out}_proj`, `layer_norm2`, `mlp.fc{1,2}`)
//! so pretrained safetensors load without renaming.

use candle_core::{DType, Device, Module, Result, Tensor, D};
use candle_nn::{layer_norm, linear, LayerNorm, Linear, VarBuilder};
use candle_transformers::models::clip::text_model::Activation;

const LAYER_NORM_EPS: f64 = 1e-5;

#[derive(Debug, Clone)]
struct SelfAttention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    out_proj: Linear,
    num_heads: usize,
    head_dim: usize,
    scale: f64,
}

impl SelfAttention {
    fn new(vb: VarBuilder, width: usize, num_heads: usize) -> Result<Self> {
        let head_dim = width / num_heads;
        Ok(Self {
            q_proj: linear(width, width, vb.pp("q_proj"))?,
            k_proj: linear(width, width, vb.pp("k_proj"))?,
            v_proj: linear(width, width, vb.pp("v_proj"))?,
            out_proj: linear(width, width, vb.pp("out_proj"))?,
            num_heads,
            head_dim,
            scale: (head_dim as f64).powf(-0.5),
        })
    }

    fn split_heads(&self, x: &Tensor, b: usize, seq: usize) -> Result<Tensor> {
        x.reshape((b, seq, self.num_heads, self.head_dim))?.transpose(1, 2)?.contiguous()
    }

    fn forward(&self, x: &Tensor, mask: Option<&Tensor>) -> Result<Tensor> {
        let (b, seq, width) = x.dims3()?;
        let q = self.split_heads(&(self.q_proj.forward(x)? * self.scale)?, b, seq)?;
        let k = self.split_heads(&self.k_proj.forward(x)?, b, seq)?;
        let v = self.split_heads(&self.v_proj.forward(x)?, b, seq)?;

        let mut attn = q.matmul(&k.t()?)?;
        if let Some(mask) = mask {
            attn = attn.broadcast_add(mask)?;
        }
        let attn = candle_nn::ops::softmax_last_dim(&attn)?;
        let out = attn.matmul(&v)?.transpose(1, 2)?.reshape((b, seq, width))?;
        self.out_proj.forward(&out)
    }
}

#[derive(Debug, Clone)]
struct Mlp {
    fc1: Linear,
    fc2: Linear,
    activation: Activation,
}

impl Module for Mlp {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.fc2.forward(&self.activation.forward(&self.fc1.forward(x)?)?)
    }
}

/// One `x + attn(ln1(x))`, `x + mlp(ln2(x))` block.
#[derive(Debug, Clone)]
pub struct ResidualAttentionBlock {
    self_attn: SelfAttention,
    layer_norm1: LayerNorm,
    mlp: Mlp,
    layer_norm2: LayerNorm,
}

impl ResidualAttentionBlock {
    pub fn new(vb: VarBuilder, width: usize, num_heads: usize) -> Result<Self> {
        Ok(Self {
            self_attn: SelfAttention::new(vb.pp("self_attn"), width, num_heads)?,
            layer_norm1: layer_norm(width, LAYER_NORM_EPS, vb.pp("layer_norm1"))?,
            mlp: Mlp {
                fc1: linear(width, width * 4, vb.pp("mlp").pp("fc1"))?,
                fc2: linear(width * 4, width, vb.pp("mlp").pp("fc2"))?,
                activation: Activation::QuickGelu,
            },
            layer_norm2: layer_norm(width, LAYER_NORM_EPS, vb.pp("layer_norm2"))?,
        })
    }

    /// `x` is `(batch, seq, width)`; `mask` broadcasts against `(batch, heads, seq, seq)`.
    pub fn forward(&self, x: &Tensor, mask: Option<&Tensor>) -> Result<Tensor> {
        let h = self.self_attn.forward(&self.layer_norm1.forward(x)?, mask)?;
        let x = (x + h)?;
        let h = self.mlp.forward(&self.layer_norm2.forward(&x)?)?;
        x + h
    }
}

/// Stack of residual blocks under `<prefix>.layers.<i>`.
#[derive(Debug, Clone)]
pub struct Encoder {
    layers: Vec<ResidualAttentionBlock>,
}

impl Encoder {
    pub fn new(vb: VarBuilder, width: usize, num_layers: usize, num_heads: usize) -> Result<Self> {
        let vb = vb.pp("layers");
        let layers = (0..num_layers)
            .map(|i| ResidualAttentionBlock::new(vb.pp(i.to_string()), width, num_heads))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { layers })
    }

    pub fn layers(&self) -> &[ResidualAttentionBlock] {
        &self.layers
    }
}

/// `(seq, seq)` additive mask with `-inf` above the diagonal.
pub fn causal_mask(seq: usize, dtype: DType, device: &Device) -> Result<Tensor> {
    let mask: Vec<f32> = (0..seq)
        .flat_map(|i| (0..seq).map(move |j| if j > i { f32::NEG_INFINITY } else { 0.0 }))
        .collect();
    Tensor::from_vec(mask, (seq, seq), device)?.to_dtype(dtype)
}

/// L2-normalise along the last dimension.
pub fn l2_normalize(x: &Tensor) -> Result<Tensor> {
    let norm = x.sqr()?.sum_keepdim(D::Minus1)?.sqrt()?;
    x.broadcast_div(&norm)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::VarMap;

    #[test]
    fn test_block_preserves_shape() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let block = ResidualAttentionBlock::new(vb, 16, 4).unwrap();
        let x = Tensor::randn(0f32, 1.0, (2, 5, 16), &Device::Cpu).unwrap();
        let mask = causal_mask(5, DType::F32, &Device::Cpu).unwrap();
        let y = block.forward(&x, Some(&mask)).unwrap();
        assert_eq!(y.dims(), &[2, 5, 16]);
    }

    #[test]
    fn test_block_uses_hf_weight_names() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        Encoder::new(vb.pp("encoder"), 8, 2, 2).unwrap();
        let data = varmap.data().lock().unwrap();
        assert!(data.contains_key("encoder.layers.1.self_attn.out_proj.weight"));
        assert!(data.contains_key("encoder.layers.0.mlp.fc1.bias"));
        assert!(data.contains_key("encoder.layers.0.layer_norm2.weight"));
    }

    #[test]
    fn test_causal_mask_layout() {
        let m = causal_mask(3, DType::F32, &Device::Cpu).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(m[0][0], 0.0);
        assert!(m[0][1].is_infinite());
        assert_eq!(m[2][1], 0.0);
    }

    #[test]
    fn test_l2_normalize_unit_rows() {
        let x = Tensor::new(&[[3f32, 4.0], [1.0, 0.0]], &Device::Cpu).unwrap();
        let n = l2_normalize(&x).unwrap().to_vec2::<f32>().unwrap();
        assert!((n[0][0] - 0.6).abs() < 1e-6);
        assert!((n[0][1] - 0.8).abs() < 1e-6);
        assert_eq!(n[1], vec![1.0, 0.0]);
    }
}
