use std::f64::consts::PI;

pub type Act = usize;

#[derive(Clone, Debug)]
pub struct Rng {
    state: u64,
}

impl Rng {
    pub fn new(seed: u64) -> Self {
        // xorshift gets stuck on an all-zero state
        Self {
            state: if seed == 0 { 0x9e37_79b9_7f4a_7c15 } else { seed },
        }
    }

    pub fn next_u64(&mut self) -> u64 {
        self.state ^= self.state << 13;
        self.state ^= self.state >> 7;
        self.state ^= self.state << 17;
        self.state
    }

    pub fn next_f64(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 / (1u64 << 53) as f64
    }

    pub fn below(&mut self, n: usize) -> usize {
        assert!(n > 0, "below requires n > 0");
        (self.next_u64() % n as u64) as usize
    }

    pub fn gauss(&mut self, mean: f64, std: f64) -> f64 {
        let u1 = self.next_f64().max(1e-10);
        let u2 = self.next_f64();
        let z = (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos();
        mean + std * z
    }

    pub fn gauss_vec(&mut self, len: usize, std: f64) -> Vec<f64> {
        (0..len).map(|_| self.gauss(0.0, std)).collect()
    }

    /// Fisher-Yates shuffle.
    pub fn shuffle<T>(&mut self, items: &mut [T]) {
        for i in (1..items.len()).rev() {
            let j = self.below(i + 1);
            items.swap(i, j);
        }
    }
}

#[derive(Clone, Debug)]
pub struct Param {
    pub data: Vec<f64>,
    pub grad: Vec<f64>,
    pub rows: usize,
    pub cols: usize,
}

impl Param {
    pub fn matrix(rng: &mut Rng, rows: usize, cols: usize, std: f64) -> Self {
        let n = rows * cols;
        Self {
            data: rng.gauss_vec(n, std),
            grad: vec![0.0; n],
            rows,
            cols,
        }
    }

    /// Column vector initialised to zero, used for biases.
    pub fn zeros(rows: usize) -> Self {
        Self {
            data: vec![0.0; rows],
            grad: vec![0.0; rows],
            rows,
            cols: 1,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn zero_grad(&mut self) {
        self.grad.fill(0.0);
    }
}

#[derive(Clone, Debug)]
enum Op {
    Linear {
        weight: usize,
        bias: usize,
        x: Act,
        out: Act,
    },
    VecAdd {
        a: Act,
        b: Act,
        out: Act,
    },
    Scale {
        x: Act,
        factor: f64,
        out: Act,
    },
    Relu {
        x: Act,
        out: Act,
    },
    Sigmoid {
        x: Act,
        out: Act,
    },
    Reparameterize {
        mu: Act,
        logvar: Act,
        eps: Vec<f64>,
        out: Act,
    },
    SquaredError {
        pred: Act,
        target: Vec<f64>,
        out: Act,
    },
    KlDivergence {
        mu: Act,
        logvar: Act,
        out: Act,
    },
}

/// Reverse-mode tape over flat f64 activations.
///
/// Activations created with [`Tape::constant`] are untracked: backward never
/// accumulates into them, which keeps the first layer from paying for an input
/// gradient nobody reads.
#[derive(Debug)]
pub struct Tape {
    params: Vec<Param>,
    act_data: Vec<Vec<f64>>,
    act_grad: Vec<Vec<f64>>,
    tracked: Vec<bool>,
    ops: Vec<Op>,
}

impl Default for Tape {
    fn default() -> Self {
        Self::new()
    }
}

impl Tape {
    pub fn new() -> Self {
        Self {
            params: Vec::new(),
            act_data: Vec::new(),
            act_grad: Vec::new(),
            tracked: Vec::new(),
            ops: Vec::new(),
        }
    }

    pub fn add_param(&mut self, p: Param) -> usize {
        let idx = self.params.len();
        self.params.push(p);
        idx
    }

    pub fn params(&self) -> &[Param] {
        &self.params
    }

    pub fn params_mut(&mut self) -> &mut [Param] {
        &mut self.params
    }

    /// Drops recorded activations and ops but keeps accumulated parameter
    /// gradients, so several forward/backward passes can sum into one step.
    pub fn clear_graph(&mut self) {
        self.act_data.clear();
        self.act_grad.clear();
        self.tracked.clear();
        self.ops.clear();
    }

    pub fn zero_grad(&mut self) {
        for p in &mut self.params {
            p.zero_grad();
        }
    }

    pub fn reset(&mut self) {
        self.clear_graph();
        self.zero_grad();
    }

    fn alloc(&mut self, size: usize, tracked: bool) -> Act {
        let idx = self.act_data.len();
        self.act_data.push(vec![0.0; size]);
        self.act_grad.push(vec![0.0; size]);
        self.tracked.push(tracked);
        idx
    }

    pub fn constant(&mut self, values: Vec<f64>) -> Act {
        let out = self.alloc(values.len(), false);
        self.act_data[out] = values;
        out
    }

    pub fn value(&self, act: Act) -> &[f64] {
        &self.act_data[act]
    }

    pub fn scalar(&self, act: Act) -> f64 {
        self.act_data[act][0]
    }

    pub fn grad(&self, act: Act) -> &[f64] {
        &self.act_grad[act]
    }

    fn assert_same_len(&self, a: Act, b: Act) {
        assert_eq!(
            self.act_data[a].len(),
            self.act_data[b].len(),
            "shape mismatch: {} != {}",
            self.act_data[a].len(),
            self.act_data[b].len()
        );
    }

    /// `weight * x + bias` for a `rows x cols` weight and a `rows` bias.
    pub fn linear(&mut self, weight: usize, bias: usize, x: Act) -> Act {
        let rows = self.params[weight].rows;
        let cols = self.params[weight].cols;
        assert_eq!(
            self.act_data[x].len(),
            cols,
            "linear input width mismatch: {} != {}",
            self.act_data[x].len(),
            cols
        );
        assert_eq!(
            self.params[bias].len(),
            rows,
            "linear bias width mismatch: {} != {}",
            self.params[bias].len(),
            rows
        );
        let out = self.alloc(rows, true);
        for r in 0..rows {
            let row = &self.params[weight].data[r * cols..(r + 1) * cols];
            let mut sum = self.params[bias].data[r];
            for (w, v) in row.iter().zip(&self.act_data[x]) {
                sum += w * v;
            }
            self.act_data[out][r] = sum;
        }
        self.ops.push(Op::Linear {
            weight,
            bias,
            x,
            out,
        });
        out
    }

    pub fn vec_add(&mut self, a: Act, b: Act) -> Act {
        self.assert_same_len(a, b);
        let n = self.act_data[a].len();
        let out = self.alloc(n, self.tracked[a] || self.tracked[b]);
        for i in 0..n {
            self.act_data[out][i] = self.act_data[a][i] + self.act_data[b][i];
        }
        self.ops.push(Op::VecAdd { a, b, out });
        out
    }

    pub fn scale(&mut self, x: Act, factor: f64) -> Act {
        let n = self.act_data[x].len();
        let out = self.alloc(n, self.tracked[x]);
        for i in 0..n {
            self.act_data[out][i] = self.act_data[x][i] * factor;
        }
        self.ops.push(Op::Scale { x, factor, out });
        out
    }

    pub fn relu(&mut self, x: Act) -> Act {
        let n = self.act_data[x].len();
        let out = self.alloc(n, self.tracked[x]);
        for i in 0..n {
            self.act_data[out][i] = self.act_data[x][i].max(0.0);
        }
        self.ops.push(Op::Relu { x, out });
        out
    }

    pub fn sigmoid(&mut self, x: Act) -> Act {
        let n = self.act_data[x].len();
        let out = self.alloc(n, self.tracked[x]);
        for i in 0..n {
            self.act_data[out][i] = 1.0 / (1.0 + (-self.act_data[x][i]).exp());
        }
        self.ops.push(Op::Sigmoid { x, out });
        out
    }

    /// `mu + exp(logvar / 2) * eps` with caller-supplied standard normal noise.
    pub fn reparameterize(&mut self, mu: Act, logvar: Act, eps: Vec<f64>) -> Act {
        self.assert_same_len(mu, logvar);
        assert_eq!(
            eps.len(),
            self.act_data[mu].len(),
            "noise width mismatch: {} != {}",
            eps.len(),
            self.act_data[mu].len()
        );
        let n = eps.len();
        let out = self.alloc(n, self.tracked[mu] || self.tracked[logvar]);
        for i in 0..n {
            let std = (0.5 * self.act_data[logvar][i]).exp();
            self.act_data[out][i] = self.act_data[mu][i] + std * eps[i];
        }
        self.ops.push(Op::Reparameterize {
            mu,
            logvar,
            eps,
            out,
        });
        out
    }

    /// Summed squared error against a fixed target. Scalar output.
    pub fn squared_error(&mut self, pred: Act, target: Vec<f64>) -> Act {
        assert_eq!(
            self.act_data[pred].len(),
            target.len(),
            "target width mismatch: {} != {}",
            self.act_data[pred].len(),
            target.len()
        );
        let out = self.alloc(1, self.tracked[pred]);
        self.act_data[out][0] = self.act_data[pred]
            .iter()
            .zip(&target)
            .map(|(p, t)| (p - t) * (p - t))
            .sum();
        self.ops.push(Op::SquaredError { pred, target, out });
        out
    }

    /// KL divergence of `N(mu, exp(logvar))` from the standard normal. Scalar output.
    pub fn kl_divergence(&mut self, mu: Act, logvar: Act) -> Act {
        self.assert_same_len(mu, logvar);
        let out = self.alloc(1, self.tracked[mu] || self.tracked[logvar]);
        let mut sum = 0.0;
        for (m, lv) in self.act_data[mu].iter().zip(&self.act_data[logvar]) {
            sum += 1.0 + lv - m * m - lv.exp();
        }
        self.act_data[out][0] = -0.5 * sum;
        self.ops.push(Op::KlDivergence { mu, logvar, out });
        out
    }

    pub fn backward(&mut self, loss: Act) {
        assert_eq!(self.act_data[loss].len(), 1, "loss must be scalar");
        self.act_grad[loss][0] = 1.0;

        let ops = std::mem::take(&mut self.ops);
        for op in ops.into_iter().rev() {
            match op {
                Op::Linear {
                    weight,
                    bias,
                    x,
                    out,
                } => {
                    let rows = self.params[weight].rows;
                    let cols = self.params[weight].cols;
                    let propagate = self.tracked[x];
                    for r in 0..rows {
                        let go = self.act_grad[out][r];
                        if go == 0.0 {
                            continue;
                        }
                        self.params[bias].grad[r] += go;
                        let row_start = r * cols;
                        for c in 0..cols {
                            self.params[weight].grad[row_start + c] += go * self.act_data[x][c];
                            if propagate {
                                self.act_grad[x][c] += go * self.params[weight].data[row_start + c];
                            }
                        }
                    }
                }
                Op::VecAdd { a, b, out } => {
                    for i in 0..self.act_data[out].len() {
                        let g = self.act_grad[out][i];
                        if self.tracked[a] {
                            self.act_grad[a][i] += g;
                        }
                        if self.tracked[b] {
                            self.act_grad[b][i] += g;
                        }
                    }
                }
                Op::Scale { x, factor, out } => {
                    if self.tracked[x] {
                        for i in 0..self.act_data[out].len() {
                            self.act_grad[x][i] += self.act_grad[out][i] * factor;
                        }
                    }
                }
                Op::Relu { x, out } => {
                    if self.tracked[x] {
                        for i in 0..self.act_data[out].len() {
                            if self.act_data[x][i] > 0.0 {
                                self.act_grad[x][i] += self.act_grad[out][i];
                            }
                        }
                    }
                }
                Op::Sigmoid { x, out } => {
                    if self.tracked[x] {
                        for i in 0..self.act_data[out].len() {
                            let y = self.act_data[out][i];
                            self.act_grad[x][i] += self.act_grad[out][i] * y * (1.0 - y);
                        }
                    }
                }
                Op::Reparameterize {
                    mu,
                    logvar,
                    eps,
                    out,
                } => {
                    for i in 0..eps.len() {
                        let g = self.act_grad[out][i];
                        if self.tracked[mu] {
                            self.act_grad[mu][i] += g;
                        }
                        if self.tracked[logvar] {
                            let std = (0.5 * self.act_data[logvar][i]).exp();
                            self.act_grad[logvar][i] += g * eps[i] * 0.5 * std;
                        }
                    }
                }
                Op::SquaredError { pred, target, out } => {
                    let upstream = self.act_grad[out][0];
                    if self.tracked[pred] {
                        for (i, t) in target.iter().enumerate() {
                            self.act_grad[pred][i] += upstream * 2.0 * (self.act_data[pred][i] - t);
                        }
                    }
                }
                Op::KlDivergence { mu, logvar, out } => {
                    let upstream = self.act_grad[out][0];
                    for i in 0..self.act_data[mu].len() {
                        if self.tracked[mu] {
                            self.act_grad[mu][i] += upstream * self.act_data[mu][i];
                        }
                        if self.tracked[logvar] {
                            let lv = self.act_data[logvar][i];
                            self.act_grad[logvar][i] += upstream * 0.5 * (lv.exp() - 1.0);
                        }
                    }
                }
            }
        }
    }
}
