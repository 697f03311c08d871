use candle_core::{Error, Result, Tensor};
use candle_nn::{linear, Linear, Module, VarBuilder};
use rand::{rngs::StdRng, Rng};

use crate::config::ModelConfig;

/// Masked-reconstruction model over fixed-length signal windows.
///
/// The encoder maps a flattened `(leads * window)` signal to an embedding;
/// the decoder reconstructs the full window from that embedding. Training
/// hides a random fraction of timesteps (all leads at once, so the model
/// cannot copy a masked sample from a sibling lead) and scores the
/// reconstruction only on the hidden region.
pub struct MaskedSignalModel {
    config: ModelConfig,
    enc_fc1: Linear,
    enc_fc2: Linear,
    dec_fc1: Linear,
    dec_fc2: Linear,
}

impl MaskedSignalModel {
    /// Builds the model, registering parameters under `encoder.*` and
    /// `decoder.*` prefixes of the provided builder.
    pub fn new(config: ModelConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;
        let input_dim = config.input_dim();

        let enc = vb.pp("encoder");
        let enc_fc1 = linear(input_dim, config.hidden_size, enc.pp("fc1"))?;
        let enc_fc2 = linear(config.hidden_size, config.embed_dim, enc.pp("fc2"))?;

        let dec = vb.pp("decoder");
        let dec_fc1 = linear(config.embed_dim, config.hidden_size, dec.pp("fc1"))?;
        let dec_fc2 = linear(config.hidden_size, input_dim, dec.pp("fc2"))?;

        Ok(Self {
            config,
            enc_fc1,
            enc_fc2,
            dec_fc1,
            dec_fc2,
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Encoder forward pass: `(batch, leads * window)` -> `(batch, embed_dim)`.
    pub fn embed(&self, flat: &Tensor) -> Result<Tensor> {
        let hidden = self.enc_fc1.forward(flat)?.gelu()?;
        self.enc_fc2.forward(&hidden)
    }

    fn reconstruct(&self, embedding: &Tensor) -> Result<Tensor> {
        let hidden = self.dec_fc1.forward(embedding)?.gelu()?;
        self.dec_fc2.forward(&hidden)
    }

    /// One self-supervised step over a `(batch, leads, window)` batch.
    /// Returns the scalar masked-reconstruction loss tensor.
    pub fn forward_loss(&self, batch: &Tensor, rng: &mut StdRng) -> Result<Tensor> {
        let (batch_size, leads, window) = batch.dims3()?;
        if leads != self.config.num_leads || window != self.config.window_size {
            return Err(Error::Msg(format!(
                "batch shaped ({leads}, {window}) does not match model window ({}, {})",
                self.config.num_leads, self.config.window_size
            )));
        }

        let (mask_values, masked_count) = self.sample_time_mask(batch_size, rng);
        let input_dim = self.config.input_dim();
        let mask = Tensor::from_vec(mask_values, (batch_size, input_dim), batch.device())?;

        let flat = batch.reshape((batch_size, input_dim))?;
        let visible = flat.mul(&mask.affine(-1.0, 1.0)?)?;

        let recon = self.reconstruct(&self.embed(&visible)?)?;
        let masked_err = recon.sub(&flat)?.mul(&mask)?;
        masked_err
            .sqr()?
            .sum_all()?
            .affine(1.0 / masked_count as f64, 0.0)
    }

    /// Per-sample time mask expanded across leads; 1 marks a hidden sample.
    /// At least one timestep per sample is always hidden so the loss
    /// denominator never degenerates.
    fn sample_time_mask(&self, batch_size: usize, rng: &mut StdRng) -> (Vec<f32>, usize) {
        let window = self.config.window_size;
        let leads = self.config.num_leads;
        let mut values = Vec::with_capacity(batch_size * leads * window);
        let mut masked_timesteps = 0usize;

        for _ in 0..batch_size {
            let mut time_mask = vec![0f32; window];
            let mut hidden = 0usize;
            for slot in time_mask.iter_mut() {
                if rng.gen::<f64>() < self.config.mask_ratio {
                    *slot = 1.0;
                    hidden += 1;
                }
            }
            if hidden == 0 {
                time_mask[rng.gen_range(0..window)] = 1.0;
                hidden = 1;
            }
            masked_timesteps += hidden;
            for _ in 0..leads {
                values.extend_from_slice(&time_mask);
            }
        }

        (values, masked_timesteps * leads)
    }
}
