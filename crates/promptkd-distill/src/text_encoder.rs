use candle_core::Tensor;

use promptkd_core::{l2_normalize, ClipBackbone};

use crate::error::{DistillError, DistillResult};
use crate::prompt_learner::Prompts;

/// Maps prompt embeddings to text features through the frozen text tower.
///
/// Holds no weights of its own: the transformer, final layer norm and
/// projection are borrowed from the backbone.
pub struct TextEncoder<'a> {
    clip: &'a ClipBackbone,
}

impl<'a> TextEncoder<'a> {
    pub fn new(clip: &'a ClipBackbone) -> Self {
        Self { clip }
    }

    /// `(n, seq, width)` prompts → `(n, embed_dim)` unnormalised features,
    /// read at each row's end-of-text position.
    pub fn forward(&self, prompts: &Prompts) -> DistillResult<Tensor> {
        let hidden = self.clip.text_hidden_states(&prompts.embeddings)?;
        let pooled = gather_rows(&hidden, &prompts.eot_positions)?;
        Ok(self.clip.project_text(&pooled)?)
    }

    /// Unit-norm text features.
    pub fn encode(&self, prompts: &Prompts) -> DistillResult<Tensor> {
        Ok(l2_normalize(&self.forward(prompts)?)?)
    }
}

/// Pick `hidden[i, positions[i], :]` for every row.
pub(crate) fn gather_rows(hidden: &Tensor, positions: &[usize]) -> DistillResult<Tensor> {
    let (n, seq, width) = hidden.dims3()?;
    if positions.len() != n {
        return Err(DistillError::InvalidBatch(format!("{} end positions for {} prompts", positions.len(), n)));
    }
    if let Some(&bad) = positions.iter().find(|&&p| p >= seq) {
        return Err(DistillError::InvalidBatch(format!("end position {bad} outside a {seq}-token sequence")));
    }
    let flat_index: Vec<u32> = positions.iter().enumerate().map(|(i, &p)| (i * seq + p) as u32).collect();
    let index = Tensor::from_vec(flat_index, n, hidden.device())?;
    Ok(hidden.reshape((n * seq, width))?.index_select(&index, 0)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prompt_learner::Prompts;
    use crate::testing::tiny_backbone;
    use candle_core::{DType, Device, D};
    use promptkd_core::testing::tiny_spec;
    use promptkd_core::PromptDesign;

    #[test]
    fn test_gather_rows_picks_positions() {
        let hidden = Tensor::arange(0f32, 12.0, &Device::Cpu).unwrap().reshape((2, 3, 2)).unwrap();
        let out = gather_rows(&hidden, &[2, 0]).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(out, vec![vec![4.0, 5.0], vec![6.0, 7.0]]);
    }

    #[test]
    fn test_gather_rows_rejects_out_of_range() {
        let hidden = Tensor::zeros((1, 3, 2), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(gather_rows(&hidden, &[3]), Err(DistillError::InvalidBatch(_))));
        assert!(matches!(gather_rows(&hidden, &[0, 1]), Err(DistillError::InvalidBatch(_))));
    }

    #[test]
    fn test_encode_is_unit_norm() {
        let spec = tiny_spec();
        let (clip, _) = tiny_backbone(&spec, PromptDesign::standard(), &Device::Cpu);
        let embeddings =
            Tensor::randn(0f32, 1.0, (3, spec.context_length, spec.text_width), &Device::Cpu).unwrap();
        let prompts = Prompts { embeddings, eot_positions: vec![3, 5, 15] };
        let feats = TextEncoder::new(&clip).encode(&prompts).unwrap();
        assert_eq!(feats.dims(), &[3, spec.embed_dim]);
        let norms = feats.sqr().unwrap().sum(D::Minus1).unwrap().sqrt().unwrap().to_vec1::<f32>().unwrap();
        for n in norms {
            assert!((n - 1.0).abs() < 1e-5);
        }
    }
}
