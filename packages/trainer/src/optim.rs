use crate::autograd::Tape;

/// Adam over every parameter registered on a tape.
#[derive(Debug, Clone)]
pub struct Adam {
    lr: f64,
    beta1: f64,
    beta2: f64,
    eps: f64,
    t: u64,
    m: Vec<Vec<f64>>,
    v: Vec<Vec<f64>>,
}

/// Moment buffers and step count, as persisted next to model weights.
#[derive(Debug, Clone, PartialEq)]
pub struct AdamState {
    pub step: u64,
    pub first_moments: Vec<Vec<f64>>,
    pub second_moments: Vec<Vec<f64>>,
}

/// Borrowed view of the live moment buffers, for writing checkpoints
/// without copying them.
#[derive(Debug, Clone, Copy)]
pub struct AdamMoments<'a> {
    pub step: u64,
    pub first: &'a [Vec<f64>],
    pub second: &'a [Vec<f64>],
}

impl AdamState {
    pub fn moments(&self) -> AdamMoments<'_> {
        AdamMoments {
            step: self.step,
            first: &self.first_moments,
            second: &self.second_moments,
        }
    }
}

impl Adam {
    pub fn new(tape: &Tape, lr: f64) -> Self {
        let zeros = || {
            tape.params()
                .iter()
                .map(|p| vec![0.0; p.len()])
                .collect::<Vec<_>>()
        };
        Self {
            lr,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            t: 0,
            m: zeros(),
            v: zeros(),
        }
    }

    pub fn learning_rate(&self) -> f64 {
        self.lr
    }

    pub fn steps(&self) -> u64 {
        self.t
    }

    pub fn step(&mut self, tape: &mut Tape) {
        self.t += 1;
        let t = self.t as f64;
        let bias1 = 1.0 - self.beta1.powf(t);
        let bias2 = 1.0 - self.beta2.powf(t);
        for (param_idx, param) in tape.params_mut().iter_mut().enumerate() {
            let m = &mut self.m[param_idx];
            let v = &mut self.v[param_idx];
            for i in 0..param.data.len() {
                let grad = param.grad[i];
                m[i] = self.beta1 * m[i] + (1.0 - self.beta1) * grad;
                v[i] = self.beta2 * v[i] + (1.0 - self.beta2) * grad * grad;

                let m_hat = m[i] / bias1;
                let v_hat = v[i] / bias2;
                param.data[i] -= self.lr * m_hat / (v_hat.sqrt() + self.eps);
            }
        }
    }

    pub fn moments(&self) -> AdamMoments<'_> {
        AdamMoments {
            step: self.t,
            first: &self.m,
            second: &self.v,
        }
    }

    /// Replaces the moment buffers. Shapes must match the buffers this
    /// optimizer was built with.
    pub fn restore(&mut self, state: AdamState) -> Result<(), String> {
        let shapes_match = |current: &[Vec<f64>], loaded: &[Vec<f64>]| {
            current.len() == loaded.len()
                && current.iter().zip(loaded).all(|(a, b)| a.len() == b.len())
        };
        if !shapes_match(&self.m, &state.first_moments)
            || !shapes_match(&self.v, &state.second_moments)
        {
            return Err("optimizer state shape mismatch".to_string());
        }
        self.t = state.step;
        self.m = state.first_moments;
        self.v = state.second_moments;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::autograd::{Param, Rng, Tape};

    use super::{Adam, AdamState};

    fn owned_state(adam: &Adam) -> AdamState {
        let moments = adam.moments();
        AdamState {
            step: moments.step,
            first_moments: moments.first.to_vec(),
            second_moments: moments.second.to_vec(),
        }
    }

    #[test]
    fn step_moves_parameters_against_gradient() {
        let mut tape = Tape::new();
        let mut rng = Rng::new(4);
        let p = tape.add_param(Param::matrix(&mut rng, 1, 2, 0.1));
        let mut adam = Adam::new(&tape, 1e-2);
        let before = tape.params()[p].data.clone();

        tape.params_mut()[p].grad = vec![1.0, -1.0];
        adam.step(&mut tape);

        let after = &tape.params()[p].data;
        assert!(after[0] < before[0]);
        assert!(after[1] > before[1]);
        assert_eq!(adam.steps(), 1);
    }

    #[test]
    fn restore_rejects_mismatched_shapes() {
        let mut tape = Tape::new();
        tape.add_param(Param::zeros(3));
        let mut adam = Adam::new(&tape, 1e-3);

        let mut state = owned_state(&adam);
        state.first_moments[0].push(0.0);
        assert!(adam.restore(state).is_err());

        let mut state = owned_state(&adam);
        state.step = 9;
        adam.restore(state).expect("restore");
        assert_eq!(adam.steps(), 9);
    }

    #[test]
    fn moments_borrow_the_live_buffers() {
        let mut tape = Tape::new();
        let p = tape.add_param(Param::zeros(2));
        let mut adam = Adam::new(&tape, 1e-2);
        tape.params_mut()[p].grad = vec![0.5, -2.0];
        adam.step(&mut tape);

        let moments = adam.moments();
        assert_eq!(moments.step, 1);
        assert!(std::ptr::eq(moments.first[0].as_ptr(), adam.m[0].as_ptr()));
        assert!((moments.first[0][0] - 0.05).abs() < 1e-12);
        assert!((moments.second[0][1] - 0.004).abs() < 1e-12);
    }
}
