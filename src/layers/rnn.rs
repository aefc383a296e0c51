use std::fmt;

use log::debug;
use ndarray::{concatenate, s, stack, Array2, ArrayView2, Axis, Ix2};
use serde::{Deserialize, Serialize};

use crate::{
    activations::{ActivFunc, Activation, Sigmoid},
    error::{Error, Result},
    initializer::Init,
    layers::{
        cache_mismatch, dropout_mask, KeepProb, KwargsReader, Layer, LayerCache, LayerConfig,
        LayerKind, PrimaryParam, RunContext, TensorShape,
    },
    storage::{Allocator, Param, Storage},
    Tensor,
};

/// Added to the forget gate's pre-activation.
const FORGET_BIAS: f32 = 1.;

/// Kind of recurrent cell used at every level of a recurrent stack.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CellType {
    Lstm,
    Gru,
}

impl CellType {
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "lstm" => Ok(CellType::Lstm),
            "gru" => Ok(CellType::Gru),
            _ => Err(Error::Lookup {
                kind: "RNN cell type",
                name: name.to_owned(),
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            CellType::Lstm => "lstm",
            CellType::Gru => "gru",
        }
    }
}

impl Default for CellType {
    fn default() -> Self {
        CellType::Lstm
    }
}

impl fmt::Display for CellType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn sigmoid(x: f32) -> f32 {
    Sigmoid.evaluate(x)
}

fn sigmoid_prime(y: &Array2<f32>) -> Array2<f32> {
    y.mapv(|y| y * (1. - y))
}

fn cols(a: &Array2<f32>, k: usize, width: usize) -> ArrayView2<'_, f32> {
    a.slice(s![.., k * width..(k + 1) * width])
}

fn concat(views: &[ArrayView2<'_, f32>]) -> Result<Array2<f32>> {
    concatenate(Axis(1), views).map_err(|e| Error::Shape(e.to_string()))
}

fn time_order(steps: usize, reverse: bool) -> Vec<usize> {
    if reverse {
        (0..steps).rev().collect()
    } else {
        (0..steps).collect()
    }
}

/// Values recorded by a single cell step.
#[derive(Debug, Clone)]
enum StepCache {
    Lstm {
        z: Array2<f32>,
        pre: Array2<f32>,
        i: Array2<f32>,
        j: Array2<f32>,
        f: Array2<f32>,
        o: Array2<f32>,
        c_prev: Array2<f32>,
        c: Array2<f32>,
        ac: Array2<f32>,
    },
    Gru {
        z: Array2<f32>,
        r: Array2<f32>,
        u: Array2<f32>,
        h_prev: Array2<f32>,
        zc: Array2<f32>,
        cand_pre: Array2<f32>,
        cand: Array2<f32>,
    },
}

/// A single recurrent cell. Gate weights act on the concatenation of the input and the
/// previous hidden state.
#[derive(Debug, Clone)]
struct Cell {
    activation: Activation,
    n_inputs: usize,
    n_units: usize,
    kernel: Param,
    bias: Param,
    candidate: Option<(Param, Param)>,
}

impl Cell {
    fn new(
        cell_type: CellType,
        activation: Activation,
        n_inputs: usize,
        n_units: usize,
        alloc: &mut Allocator,
    ) -> Self {
        let fan_in = n_inputs + n_units;
        let (kernel, bias, candidate) = match cell_type {
            CellType::Lstm => (
                alloc.allocate(&[fan_in, 4 * n_units], Init::Xavier, fan_in),
                alloc.allocate(&[4 * n_units], Init::Zeros, fan_in),
                None,
            ),
            CellType::Gru => (
                alloc.allocate(&[fan_in, 2 * n_units], Init::Xavier, fan_in),
                alloc.allocate(&[2 * n_units], Init::Ones, fan_in),
                Some((
                    alloc.allocate(&[fan_in, n_units], Init::Xavier, fan_in),
                    alloc.allocate(&[n_units], Init::Zeros, fan_in),
                )),
            ),
        };
        Self {
            activation,
            n_inputs,
            n_units,
            kernel,
            bias,
            candidate,
        }
    }

    fn params(&self, prefix: &str) -> Vec<(String, &Param)> {
        match &self.candidate {
            None => vec![
                (format!("{}/kernel", prefix), &self.kernel),
                (format!("{}/bias", prefix), &self.bias),
            ],
            Some((kernel, bias)) => vec![
                (format!("{}/gates/kernel", prefix), &self.kernel),
                (format!("{}/gates/bias", prefix), &self.bias),
                (format!("{}/candidate/kernel", prefix), kernel),
                (format!("{}/candidate/bias", prefix), bias),
            ],
        }
    }

    fn step(
        &self,
        x: &Array2<f32>,
        h: &Array2<f32>,
        c: &Array2<f32>,
        storage: &Storage,
    ) -> Result<(Array2<f32>, Array2<f32>, StepCache)> {
        let u = self.n_units;
        let z = concat(&[x.view(), h.view()])?;
        let pre = z.dot(&storage.matrix(&self.kernel)?) + &storage.matrix(&self.bias)?;
        match &self.candidate {
            None => {
                let i = cols(&pre, 0, u).mapv(sigmoid);
                let j = self.activation.forward(&cols(&pre, 1, u).to_owned());
                let f = cols(&pre, 2, u).mapv(|x| sigmoid(x + FORGET_BIAS));
                let o = cols(&pre, 3, u).mapv(sigmoid);
                let c_new = &f * c + &i * &j;
                let ac = self.activation.forward(&c_new);
                let h_new = &o * &ac;
                let cache = StepCache::Lstm {
                    z,
                    pre,
                    i,
                    j,
                    f,
                    o,
                    c_prev: c.clone(),
                    c: c_new.clone(),
                    ac,
                };
                Ok((h_new, c_new, cache))
            }
            Some((cand_kernel, cand_bias)) => {
                let gates = pre.mapv(sigmoid);
                let r = cols(&gates, 0, u).to_owned();
                let upd = cols(&gates, 1, u).to_owned();
                let zc = concat(&[x.view(), (&r * h).view()])?;
                let cand_pre =
                    zc.dot(&storage.matrix(cand_kernel)?) + &storage.matrix(cand_bias)?;
                let cand = self.activation.forward(&cand_pre);
                let h_new = &upd * h + &upd.mapv(|v| 1. - v) * &cand;
                let cache = StepCache::Gru {
                    z,
                    r,
                    u: upd,
                    h_prev: h.clone(),
                    zc,
                    cand_pre,
                    cand,
                };
                // GRU cells carry no separate cell state
                Ok((h_new.clone(), h_new, cache))
            }
        }
    }

    /// Returns the gradients w.r.t. the step's input, previous hidden state and previous
    /// cell state.
    fn step_backward(
        &self,
        cache: &StepCache,
        dh: &Array2<f32>,
        dc_next: &Array2<f32>,
        storage: &Storage,
        grads: &mut Storage,
    ) -> Result<(Array2<f32>, Array2<f32>, Array2<f32>)> {
        let n_in = self.n_inputs;
        let u = self.n_units;
        match (cache, &self.candidate) {
            (
                StepCache::Lstm {
                    z,
                    pre,
                    i,
                    j,
                    f,
                    o,
                    c_prev,
                    c,
                    ac,
                },
                None,
            ) => {
                let d_o = dh * ac;
                let dc = dc_next + &self.activation.backward(c, ac, &(dh * o));
                let da_i = &dc * j * sigmoid_prime(i);
                let da_j = self
                    .activation
                    .backward(&cols(pre, 1, u).to_owned(), j, &(&dc * i));
                let da_f = &dc * c_prev * sigmoid_prime(f);
                let da_o = d_o * sigmoid_prime(o);
                let dc_prev = &dc * f;
                let da = concat(&[da_i.view(), da_j.view(), da_f.view(), da_o.view()])?;

                grads
                    .matrix_mut(&self.kernel)?
                    .scaled_add(1., &z.t().dot(&da));
                grads
                    .matrix_mut(&self.bias)?
                    .scaled_add(1., &da.sum_axis(Axis(0)).insert_axis(Axis(0)));
                let dz = da.dot(&storage.matrix(&self.kernel)?.t());
                let dx = dz.slice(s![.., ..n_in]).to_owned();
                let dh_prev = dz.slice(s![.., n_in..]).to_owned();
                Ok((dx, dh_prev, dc_prev))
            }
            (
                StepCache::Gru {
                    z,
                    r,
                    u: upd,
                    h_prev,
                    zc,
                    cand_pre,
                    cand,
                },
                Some((cand_kernel, cand_bias)),
            ) => {
                let du = dh * &(h_prev - cand);
                let dcand = dh * &upd.mapv(|v| 1. - v);
                let mut dh_prev = dh * upd;

                let dcand_pre = self.activation.backward(cand_pre, cand, &dcand);
                grads
                    .matrix_mut(cand_kernel)?
                    .scaled_add(1., &zc.t().dot(&dcand_pre));
                grads
                    .matrix_mut(cand_bias)?
                    .scaled_add(1., &dcand_pre.sum_axis(Axis(0)).insert_axis(Axis(0)));
                let dzc = dcand_pre.dot(&storage.matrix(cand_kernel)?.t());
                let mut dx = dzc.slice(s![.., ..n_in]).to_owned();
                let drh = dzc.slice(s![.., n_in..]);
                let dr = &drh * h_prev;
                dh_prev += &(&drh * r);

                let dg = concat(&[
                    (dr * sigmoid_prime(r)).view(),
                    (du * sigmoid_prime(upd)).view(),
                ])?;
                grads
                    .matrix_mut(&self.kernel)?
                    .scaled_add(1., &z.t().dot(&dg));
                grads
                    .matrix_mut(&self.bias)?
                    .scaled_add(1., &dg.sum_axis(Axis(0)).insert_axis(Axis(0)));
                let dz = dg.dot(&storage.matrix(&self.kernel)?.t());
                dx += &dz.slice(s![.., ..n_in]);
                dh_prev += &dz.slice(s![.., n_in..]);

                let dc_prev = Array2::zeros((dh.nrows(), u));
                Ok((dx, dh_prev, dc_prev))
            }
            _ => Err(cache_mismatch()),
        }
    }

    /// Run the cell over a whole sequence, optionally from the last step to the first.
    /// Outputs are indexed by time step either way.
    fn run(
        &self,
        xs: &[Array2<f32>],
        batch: usize,
        storage: &Storage,
        reverse: bool,
    ) -> Result<(Vec<Array2<f32>>, Vec<StepCache>)> {
        let mut h = Array2::zeros((batch, self.n_units));
        let mut c = h.clone();
        let mut outputs = vec![Array2::zeros((batch, self.n_units)); xs.len()];
        let mut caches = Vec::with_capacity(xs.len());
        for t in time_order(xs.len(), reverse) {
            let (h_new, c_new, cache) = self.step(&xs[t], &h, &c, storage)?;
            outputs[t] = h_new.clone();
            h = h_new;
            c = c_new;
            caches.push(cache);
        }
        Ok((outputs, caches))
    }

    /// Backpropagation through time.
    fn run_backward(
        &self,
        caches: &[StepCache],
        out_grads: &[Array2<f32>],
        batch: usize,
        storage: &Storage,
        grads: &mut Storage,
        reverse: bool,
    ) -> Result<Vec<Array2<f32>>> {
        let mut in_grads = vec![Array2::zeros((batch, self.n_inputs)); out_grads.len()];
        let mut dh_next = Array2::zeros((batch, self.n_units));
        let mut dc_next = dh_next.clone();
        let order = time_order(out_grads.len(), reverse);
        for (cache, &t) in caches.iter().zip(&order).rev() {
            let dh = &out_grads[t] + &dh_next;
            let (dx, dh_prev, dc_prev) =
                self.step_backward(cache, &dh, &dc_next, storage, grads)?;
            in_grads[t] = dx;
            dh_next = dh_prev;
            dc_next = dc_prev;
        }
        Ok(in_grads)
    }
}

/// Split a (batch, time, features) tensor into one matrix per time step.
fn split_steps(x: &Tensor, width: usize) -> Result<Vec<Array2<f32>>> {
    if x.ndim() != 3 || x.shape()[2] != width {
        return Err(Error::Shape(format!(
            "Expected a (batch, time, {}) input, got shape {:?}.",
            width,
            x.shape()
        )));
    }
    x.axis_iter(Axis(1))
        .map(|step| {
            step.to_owned()
                .into_dimensionality::<Ix2>()
                .map_err(|e| Error::Shape(e.to_string()))
        })
        .collect()
}

fn join_steps(steps: &[Array2<f32>], batch: usize, width: usize) -> Result<Tensor> {
    if steps.is_empty() {
        return Ok(Tensor::zeros(vec![batch, 0, width]));
    }
    let views: Vec<_> = steps.iter().map(|s| s.view()).collect();
    stack(Axis(1), &views)
        .map(|a| a.into_dyn())
        .map_err(|e| Error::Shape(e.to_string()))
}

fn apply_masks(
    steps: &mut [Array2<f32>],
    ctx: &mut RunContext<'_>,
    keep_prob: KeepProb,
) -> Option<Vec<Array2<f32>>> {
    let p = ctx.dropout(keep_prob)?;
    let masks: Vec<_> = steps
        .iter()
        .map(|s| dropout_mask(ctx.rng, s.dim(), p))
        .collect();
    for (s, m) in steps.iter_mut().zip(&masks) {
        *s *= m;
    }
    Some(masks)
}

fn unapply_masks(steps: &mut [Array2<f32>], masks: &Option<Vec<Array2<f32>>>) {
    if let Some(masks) = masks {
        for (s, m) in steps.iter_mut().zip(masks) {
            *s *= m;
        }
    }
}

/// Options shared by the unidirectional and bidirectional stacks.
struct StackOptions {
    n_units: Vec<usize>,
    cell_type: CellType,
    activation: Activation,
}

impl StackOptions {
    fn parse(param: &PrimaryParam, kwargs: &mut KwargsReader<'_>) -> Result<Self> {
        let n_units = param.units_list("n_units")?;
        let cell_type = match kwargs.take_str("cell_type")? {
            Some(name) => CellType::from_name(&name)?,
            None => CellType::default(),
        };
        let activation = match kwargs.take_str("activation")? {
            Some(name) => Activation::from_name(&name)?,
            None => Activation::from_name("tanh")?,
        };
        Ok(Self {
            n_units,
            cell_type,
            activation,
        })
    }
}

#[derive(Debug, Clone)]
struct LevelCache {
    steps: Vec<StepCache>,
    masks: Option<Vec<Array2<f32>>>,
}

#[derive(Debug, Clone)]
pub struct RnnCache {
    batch: usize,
    levels: Vec<LevelCache>,
}

/// A stack of unidirectional recurrent layers over (batch, time, features) inputs,
/// returning the top level's full output sequence.
#[derive(Debug, Clone)]
pub struct RecurrentStack {
    input: TensorShape,
    output: TensorShape,
    n_inputs: usize,
    n_units: Vec<usize>,
    cell_type: CellType,
    activation: Activation,
    keep_prob: KeepProb,
    scope: String,
    cells: Vec<Cell>,
}

impl RecurrentStack {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        input: &TensorShape,
        n_units: Vec<usize>,
        cell_type: CellType,
        activation: Activation,
        keep_prob: KeepProb,
        scope: String,
        alloc: &mut Allocator,
    ) -> Result<Self> {
        let n_inputs = LayerKind::RnnStack.input_width(input)?;
        let mut width = n_inputs;
        let mut cells = Vec::with_capacity(n_units.len());
        for &units in &n_units {
            cells.push(Cell::new(cell_type, activation, width, units, alloc));
            width = units;
        }
        Ok(Self {
            input: input.clone(),
            output: input.with_last(width),
            n_inputs,
            n_units,
            cell_type,
            activation,
            keep_prob,
            scope,
            cells,
        })
    }

    pub fn from_spec(
        input: &TensorShape,
        param: &PrimaryParam,
        mut kwargs: KwargsReader<'_>,
        keep_prob: KeepProb,
        scope: String,
        alloc: &mut Allocator,
    ) -> Result<Self> {
        let opts = StackOptions::parse(param, &mut kwargs)?;
        kwargs.finish()?;
        debug!(
            "Building {} stack '{}': {:?} units",
            opts.cell_type, scope, opts.n_units
        );
        Self::new(
            input,
            opts.n_units,
            opts.cell_type,
            opts.activation,
            keep_prob,
            scope,
            alloc,
        )
    }

    /// Qualified name of the stack, unique across networks.
    pub fn scope(&self) -> &str {
        &self.scope
    }
}

impl Layer for RecurrentStack {
    fn kind(&self) -> LayerKind {
        LayerKind::RnnStack
    }

    fn configuration(&self) -> LayerConfig {
        LayerConfig::RnnStack {
            n_inputs: self.n_inputs,
            n_units: self.n_units.clone(),
            cell_type: self.cell_type,
            activation: self.activation,
            keep_prob: self.keep_prob,
        }
    }

    fn input_shape(&self) -> &TensorShape {
        &self.input
    }

    fn output_shape(&self) -> &TensorShape {
        &self.output
    }

    fn params(&self) -> Vec<(String, &Param)> {
        self.cells
            .iter()
            .enumerate()
            .flat_map(|(i, cell)| cell.params(&format!("cell_{}", i)))
            .collect()
    }

    fn forward(&self, input: &Tensor, ctx: &mut RunContext<'_>) -> Result<(Tensor, LayerCache)> {
        let batch = input.shape().first().copied().unwrap_or(0);
        let mut steps = split_steps(input, self.n_inputs)?;
        let mut levels = Vec::with_capacity(self.cells.len());
        for cell in &self.cells {
            let (mut outputs, caches) = cell.run(&steps, batch, ctx.storage, false)?;
            let masks = apply_masks(&mut outputs, ctx, self.keep_prob);
            levels.push(LevelCache {
                steps: caches,
                masks,
            });
            steps = outputs;
        }
        let width = self.output.last().unwrap_or(0);
        let output = join_steps(&steps, batch, width)?;
        Ok((output, LayerCache::Recurrent(RnnCache { batch, levels })))
    }

    fn backward(
        &self,
        cache: &LayerCache,
        out_grads: &Tensor,
        storage: &Storage,
        grads: &mut Storage,
    ) -> Result<Tensor> {
        let cache = match cache {
            LayerCache::Recurrent(cache) => cache,
            _ => return Err(cache_mismatch()),
        };
        let width = self.output.last().unwrap_or(0);
        let mut g = split_steps(out_grads, width)?;
        for (cell, level) in self.cells.iter().zip(&cache.levels).rev() {
            unapply_masks(&mut g, &level.masks);
            g = cell.run_backward(&level.steps, &g, cache.batch, storage, grads, false)?;
        }
        join_steps(&g, cache.batch, self.n_inputs)
    }
}

#[derive(Debug, Clone)]
struct BiLevelCache {
    forward: Vec<StepCache>,
    backward: Vec<StepCache>,
    masks: Option<Vec<Array2<f32>>>,
}

#[derive(Debug, Clone)]
pub struct BiRnnCache {
    batch: usize,
    levels: Vec<BiLevelCache>,
}

/// A stack of bidirectional recurrent layers. Each level reads the sequence in both
/// directions and concatenates the two output sequences along the feature axis.
#[derive(Debug, Clone)]
pub struct BidirectionalRnn {
    input: TensorShape,
    output: TensorShape,
    n_inputs: usize,
    n_units: Vec<usize>,
    cell_type: CellType,
    activation: Activation,
    keep_prob: KeepProb,
    scope: String,
    cells: Vec<(Cell, Cell)>,
}

impl BidirectionalRnn {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        input: &TensorShape,
        n_units: Vec<usize>,
        cell_type: CellType,
        activation: Activation,
        keep_prob: KeepProb,
        scope: String,
        alloc: &mut Allocator,
    ) -> Result<Self> {
        let n_inputs = LayerKind::BiRnnStack.input_width(input)?;
        let mut width = n_inputs;
        let mut cells = Vec::with_capacity(n_units.len());
        for &units in &n_units {
            let fw = Cell::new(cell_type, activation, width, units, alloc);
            let bw = Cell::new(cell_type, activation, width, units, alloc);
            cells.push((fw, bw));
            width = 2 * units;
        }
        Ok(Self {
            input: input.clone(),
            output: input.with_last(width),
            n_inputs,
            n_units,
            cell_type,
            activation,
            keep_prob,
            scope,
            cells,
        })
    }

    pub fn from_spec(
        input: &TensorShape,
        param: &PrimaryParam,
        mut kwargs: KwargsReader<'_>,
        keep_prob: KeepProb,
        scope: String,
        alloc: &mut Allocator,
    ) -> Result<Self> {
        let opts = StackOptions::parse(param, &mut kwargs)?;
        kwargs.finish()?;
        debug!(
            "Building bidirectional {} stack '{}': {:?} units",
            opts.cell_type, scope, opts.n_units
        );
        Self::new(
            input,
            opts.n_units,
            opts.cell_type,
            opts.activation,
            keep_prob,
            scope,
            alloc,
        )
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }
}

impl Layer for BidirectionalRnn {
    fn kind(&self) -> LayerKind {
        LayerKind::BiRnnStack
    }

    fn configuration(&self) -> LayerConfig {
        LayerConfig::BiRnnStack {
            n_inputs: self.n_inputs,
            n_units: self.n_units.clone(),
            cell_type: self.cell_type,
            activation: self.activation,
            keep_prob: self.keep_prob,
        }
    }

    fn input_shape(&self) -> &TensorShape {
        &self.input
    }

    fn output_shape(&self) -> &TensorShape {
        &self.output
    }

    fn params(&self) -> Vec<(String, &Param)> {
        let mut params = Vec::new();
        for (i, (fw, bw)) in self.cells.iter().enumerate() {
            params.extend(fw.params(&format!("cell_{}/fw", i)));
            params.extend(bw.params(&format!("cell_{}/bw", i)));
        }
        params
    }

    fn forward(&self, input: &Tensor, ctx: &mut RunContext<'_>) -> Result<(Tensor, LayerCache)> {
        let batch = input.shape().first().copied().unwrap_or(0);
        let mut steps = split_steps(input, self.n_inputs)?;
        let mut levels = Vec::with_capacity(self.cells.len());
        for (fw, bw) in &self.cells {
            let (fw_out, fw_caches) = fw.run(&steps, batch, ctx.storage, false)?;
            let (bw_out, bw_caches) = bw.run(&steps, batch, ctx.storage, true)?;
            let mut outputs = fw_out
                .iter()
                .zip(&bw_out)
                .map(|(f, b)| concat(&[f.view(), b.view()]))
                .collect::<Result<Vec<_>>>()?;
            let masks = apply_masks(&mut outputs, ctx, self.keep_prob);
            levels.push(BiLevelCache {
                forward: fw_caches,
                backward: bw_caches,
                masks,
            });
            steps = outputs;
        }
        let width = self.output.last().unwrap_or(0);
        let output = join_steps(&steps, batch, width)?;
        Ok((output, LayerCache::Bidirectional(BiRnnCache { batch, levels })))
    }

    fn backward(
        &self,
        cache: &LayerCache,
        out_grads: &Tensor,
        storage: &Storage,
        grads: &mut Storage,
    ) -> Result<Tensor> {
        let cache = match cache {
            LayerCache::Bidirectional(cache) => cache,
            _ => return Err(cache_mismatch()),
        };
        let width = self.output.last().unwrap_or(0);
        let mut g = split_steps(out_grads, width)?;
        for ((fw, bw), level) in self.cells.iter().zip(&cache.levels).rev() {
            unapply_masks(&mut g, &level.masks);
            let u = fw.n_units;
            let g_fw: Vec<_> = g.iter().map(|s| cols(s, 0, u).to_owned()).collect();
            let g_bw: Vec<_> = g.iter().map(|s| cols(s, 1, u).to_owned()).collect();
            let d_fw = fw.run_backward(&level.forward, &g_fw, cache.batch, storage, grads, false)?;
            let d_bw = bw.run_backward(&level.backward, &g_bw, cache.batch, storage, grads, true)?;
            g = d_fw.into_iter().zip(d_bw).map(|(f, b)| f + b).collect();
        }
        join_steps(&g, cache.batch, self.n_inputs)
    }
}
