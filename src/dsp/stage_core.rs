//! Native inference for one enhancement stage.
//!
//! encoder -> instant layer norm -> LSTM -> LSTM -> sigmoid mask over the
//! encoded features -> decoder. The two LSTM layers read and write the two
//! recurrent state tensors handed in by the adapter, each laid out as
//! `[hidden | cell]`.

use crate::dsp::neural::{InferenceError, StageModel, STATE_HIDDEN, STATE_LEN};
use crate::dsp::stage_weights::{LstmLayer, StageWeights};
use anyhow::bail;

const ILN_EPS: f32 = 1e-7;

pub struct LstmStage {
    weights: StageWeights,
    gate_buf: Vec<f32>,
    enc_buf: Vec<f32>,
    norm_buf: Vec<f32>,
    mask_buf: Vec<f32>,
}

impl LstmStage {
    /// Fails when the weights were exported for another frame size or a
    /// hidden size other than the fixed state shape.
    pub fn new(weights: StageWeights, frame_size: usize) -> anyhow::Result<Self> {
        let dims = weights.dims;
        if dims.frame_size != frame_size {
            bail!(
                "stage weights expect frame size {}, engine uses {}",
                dims.frame_size,
                frame_size
            );
        }
        if dims.hidden != STATE_HIDDEN {
            bail!(
                "stage weights have hidden size {}, state tensors need {}",
                dims.hidden,
                STATE_HIDDEN
            );
        }
        Ok(Self {
            gate_buf: vec![0.0; 4 * dims.hidden],
            enc_buf: vec![0.0; dims.features],
            norm_buf: vec![0.0; dims.features],
            mask_buf: vec![0.0; dims.features],
            weights,
        })
    }
}

impl StageModel for LstmStage {
    fn frame_size(&self) -> usize {
        self.weights.dims.frame_size
    }

    fn run(
        &mut self,
        audio: &[f32],
        state_a: &mut [f32],
        state_b: &mut [f32],
        output: &mut [f32],
    ) -> Result<(), InferenceError> {
        let frame = self.weights.dims.frame_size;
        check_len("audio", frame, audio.len())?;
        check_len("output", frame, output.len())?;
        check_len("state_a", STATE_LEN, state_a.len())?;
        check_len("state_b", STATE_LEN, state_b.len())?;

        let w = &self.weights;
        run_linear(audio, &w.encoder, &mut self.enc_buf)?;
        instant_layer_norm(&self.enc_buf, &w.norm_mul, &w.norm_add, &mut self.norm_buf);
        run_lstm(&mut self.gate_buf, &w.lstm0, &self.norm_buf, state_a)?;
        let (hidden0, _) = state_a.split_at(STATE_HIDDEN);
        run_lstm(&mut self.gate_buf, &w.lstm1, hidden0, state_b)?;
        let (hidden1, _) = state_b.split_at(STATE_HIDDEN);
        linear_with_bias(hidden1, &w.mask_kernel, &w.mask_bias, &mut self.mask_buf)?;
        for (m, e) in self.mask_buf.iter_mut().zip(&self.enc_buf) {
            *m = sigmoid(*m) * e;
        }
        run_linear(&self.mask_buf, &w.decoder, output)
    }
}

fn check_len(what: &'static str, expected: usize, actual: usize) -> Result<(), InferenceError> {
    if expected != actual {
        return Err(InferenceError::ShapeMismatch {
            what,
            expected,
            actual,
        });
    }
    Ok(())
}

fn run_linear(input: &[f32], kernel: &[f32], output: &mut [f32]) -> Result<(), InferenceError> {
    let input_dim = input.len();
    let output_dim = output.len();
    check_len("dense kernel", input_dim * output_dim, kernel.len())?;
    for out_idx in 0..output_dim {
        let mut sum = 0.0;
        let mut kp = out_idx;
        for in_idx in 0..input_dim {
            sum += input[in_idx] * kernel[kp];
            kp += output_dim;
        }
        output[out_idx] = sum;
    }
    Ok(())
}

fn linear_with_bias(
    input: &[f32],
    kernel: &[f32],
    bias: &[f32],
    output: &mut [f32],
) -> Result<(), InferenceError> {
    check_len("dense bias", output.len(), bias.len())?;
    run_linear(input, kernel, output)?;
    for (o, b) in output.iter_mut().zip(bias) {
        *o += b;
    }
    Ok(())
}

fn run_lstm(
    gate_buf: &mut [f32],
    layer: &LstmLayer,
    input: &[f32],
    state: &mut [f32],
) -> Result<(), InferenceError> {
    let hidden_size = layer.hidden_size();
    check_len("lstm input", layer.input_size(), input.len())?;
    check_len("lstm state", 2 * hidden_size, state.len())?;
    let gates = hidden_size * 4;
    let gate_slice = &mut gate_buf[..gates];
    let (hidden, cell) = state.split_at_mut(hidden_size);
    for gate in 0..gates {
        let w_start = gate * layer.input_size();
        let r_start = gate * hidden_size;
        gate_slice[gate] = dot(&layer.w[w_start..w_start + layer.input_size()], input)
            + dot(&layer.r[r_start..r_start + hidden_size], hidden)
            + layer.bias[gate];
    }
    for idx in 0..hidden_size {
        let i = sigmoid(gate_slice[idx]);
        let o = sigmoid(gate_slice[hidden_size + idx]);
        let f = sigmoid(gate_slice[2 * hidden_size + idx]);
        let g = gate_slice[3 * hidden_size + idx].tanh();
        let new_cell = f * cell[idx] + i * g;
        cell[idx] = new_cell;
        hidden[idx] = o * new_cell.tanh();
    }
    Ok(())
}

fn dot(lhs: &[f32], rhs: &[f32]) -> f32 {
    lhs.iter().zip(rhs.iter()).map(|(a, b)| a * b).sum()
}

fn instant_layer_norm(input: &[f32], mul: &[f32], add: &[f32], output: &mut [f32]) {
    let len = input.len();
    if len == 0 {
        return;
    }
    let mean = input.iter().copied().sum::<f32>() / len as f32;
    let variance = input
        .iter()
        .map(|v| {
            let diff = v - mean;
            diff * diff
        })
        .sum::<f32>()
        / len as f32;
    let inv_std = 1.0 / (variance + ILN_EPS).sqrt();
    for i in 0..len {
        output[i] = (input[i] - mean) * inv_std * mul[i] + add[i];
    }
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}
