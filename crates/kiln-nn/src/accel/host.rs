// HostConvLibrary: a native-library implementation that runs on the host
//
// Implements the full ConvLibrary contract with direct-sum loops over NCHW
// buffers, including groups and dilation, which the im2col path does not
// support. It keeps a registry of live descriptors and counts algorithm
// queries and compute calls, which makes it the reference oracle for the
// accelerator strategy: strategy agreement, algorithm-cache behaviour and
// descriptor lifecycle are all observable through `stats()`.
//
// Three algorithms are reported by every find query, fastest first:
//
//   Scatter    no workspace, not deterministic
//   Unrolled   workspace for the unfolded input, deterministic
//   Direct     no workspace, deterministic
//
// They share one reference kernel and differ only in what they report.

use std::collections::HashMap;
use std::mem;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use kiln_core::{DataType, Error, Result};

use super::library::{
    AlgorithmCandidate, ConvLibrary, ConvolutionParams, FilterParams, TensorParams,
};

/// Descriptor handle issued by [`HostConvLibrary`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HostHandle(u64);

/// Algorithm token of [`HostConvLibrary`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostAlgorithm {
    Scatter,
    Unrolled,
    Direct,
}

/// Snapshot of the library's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HostStats {
    /// Descriptors created and not yet destroyed.
    pub live_descriptors: usize,
    pub forward_queries: usize,
    pub backward_data_queries: usize,
    pub backward_filter_queries: usize,
    /// Convolution, bias and tensor-add calls.
    pub compute_calls: usize,
}

impl HostStats {
    pub fn algorithm_queries(&self) -> usize {
        self.forward_queries + self.backward_data_queries + self.backward_filter_queries
    }
}

#[derive(Debug)]
enum Slot {
    Filter(Option<FilterParams>),
    Convolution(Option<ConvolutionParams>),
    Tensor(Option<TensorParams>),
}

#[derive(Debug, Default)]
struct HostState {
    next_handle: AtomicU64,
    slots: Mutex<HashMap<u64, Slot>>,
    forward_queries: AtomicUsize,
    backward_data_queries: AtomicUsize,
    backward_filter_queries: AtomicUsize,
    compute_calls: AtomicUsize,
}

/// Host-resident convolution library. Clones share descriptors and counters.
#[derive(Debug, Clone, Default)]
pub struct HostConvLibrary {
    state: Arc<HostState>,
}

fn bad_param(call: &'static str, detail: impl std::fmt::Display) -> Error {
    Error::native(call, format!("BAD_PARAM: {detail}"))
}

/// Advance a row-major multi-index; false once it wraps.
fn advance(index: &mut [usize], dims: &[usize]) -> bool {
    for axis in (0..index.len()).rev() {
        index[axis] += 1;
        if index[axis] < dims[axis] {
            return true;
        }
        index[axis] = 0;
    }
    false
}

/// `dst = alpha * src + beta * dst`; beta = 0 ignores stale contents.
fn blend(dst: &mut [DataType], src: &[DataType], alpha: DataType, beta: DataType) {
    for (d, s) in dst.iter_mut().zip(src) {
        *d = if beta == 0.0 {
            alpha * s
        } else {
            alpha * s + beta * *d
        };
    }
}

fn check_len(call: &'static str, what: &str, len: usize, expected: usize) -> Result<()> {
    if len != expected {
        return Err(bad_param(
            call,
            format!("{what} buffer holds {len} values, descriptor expects {expected}"),
        ));
    }
    Ok(())
}

/// A resolved convolution problem: sizes plus the tap table mapping
/// (output position, window offset) to an input offset.
struct Problem {
    batch: usize,
    in_channels: usize,
    out_channels: usize,
    groups: usize,
    in_volume: usize,
    out_volume: usize,
    window_volume: usize,
    taps: Vec<Option<usize>>,
}

impl Problem {
    fn resolve(
        call: &'static str,
        x: &TensorParams,
        w: &FilterParams,
        conv: &ConvolutionParams,
        y: &TensorParams,
    ) -> Result<Problem> {
        let rank = conv.pads.len();
        if x.dims.len() != rank + 2
            || y.dims.len() != rank + 2
            || w.dims.len() != rank + 2
            || conv.strides.len() != rank
            || conv.dilations.len() != rank
        {
            return Err(bad_param(call, "descriptor ranks disagree"));
        }
        if w.dims.iter().any(|&d| d == 0)
            || conv.strides.iter().any(|&v| v == 0)
            || conv.dilations.iter().any(|&v| v == 0)
        {
            return Err(bad_param(call, "zero filter extent, stride or dilation"));
        }
        let groups = conv.groups.max(1);
        let (batch, in_channels) = (x.dims[0], x.dims[1]);
        let out_channels = w.dims[0];
        if y.dims[0] != batch
            || y.dims[1] != out_channels
            || w.dims[1] * groups != in_channels
            || out_channels % groups != 0
        {
            return Err(bad_param(
                call,
                format!("x {:?}, w {:?}, y {:?} with {groups} groups", x.dims, w.dims, y.dims),
            ));
        }

        let in_spatial = &x.dims[2..];
        let out_spatial = &y.dims[2..];
        let window = &w.dims[2..];
        for axis in 0..rank {
            let extent = (in_spatial[axis] + 2 * conv.pads[axis]) as isize;
            let span = (conv.dilations[axis] * (window[axis] - 1) + 1) as isize;
            let expected = if extent < span {
                0
            } else {
                ((extent - span) as usize) / conv.strides[axis] + 1
            };
            if out_spatial[axis] != expected {
                return Err(bad_param(
                    call,
                    format!(
                        "output extent {} along axis {axis}, expected {expected}",
                        out_spatial[axis]
                    ),
                ));
            }
        }

        let in_volume: usize = in_spatial.iter().product();
        let out_volume: usize = out_spatial.iter().product();
        let window_volume: usize = window.iter().product();
        let mut taps = Vec::with_capacity(out_volume * window_volume);
        let mut pos = vec![0usize; rank];
        for _ in 0..out_volume {
            let mut offset_in_window = vec![0usize; rank];
            for _ in 0..window_volume {
                let mut offset = 0usize;
                let mut inside = true;
                for axis in 0..rank {
                    let coord = (pos[axis] * conv.strides[axis]
                        + offset_in_window[axis] * conv.dilations[axis])
                        as isize
                        - conv.pads[axis] as isize;
                    if coord < 0 || coord >= in_spatial[axis] as isize {
                        inside = false;
                        break;
                    }
                    offset = offset * in_spatial[axis] + coord as usize;
                }
                taps.push(inside.then_some(offset));
                advance(&mut offset_in_window, window);
            }
            advance(&mut pos, out_spatial);
        }

        Ok(Problem {
            batch,
            in_channels,
            out_channels,
            groups,
            in_volume,
            out_volume,
            window_volume,
            taps,
        })
    }

    fn x_len(&self) -> usize {
        self.batch * self.in_channels * self.in_volume
    }

    fn y_len(&self) -> usize {
        self.batch * self.out_channels * self.out_volume
    }

    fn w_len(&self) -> usize {
        self.out_channels * (self.in_channels / self.groups) * self.window_volume
    }

    fn unrolled_bytes(&self) -> usize {
        self.batch * self.in_channels * self.window_volume * self.out_volume * mem::size_of::<DataType>()
    }

    /// Visit every (x index, w index, y index) triple that contributes.
    fn for_each_tap(&self, mut f: impl FnMut(usize, usize, usize)) {
        let cg = self.in_channels / self.groups;
        let kg = self.out_channels / self.groups;
        let wv = self.window_volume;
        for b in 0..self.batch {
            for k in 0..self.out_channels {
                let group = k / kg;
                let y_base = (b * self.out_channels + k) * self.out_volume;
                for cl in 0..cg {
                    let c = group * cg + cl;
                    let x_base = (b * self.in_channels + c) * self.in_volume;
                    let w_base = (k * cg + cl) * wv;
                    for o in 0..self.out_volume {
                        let window = &self.taps[o * wv..(o + 1) * wv];
                        for (t, tap) in window.iter().enumerate() {
                            if let Some(off) = tap {
                                f(x_base + off, w_base + t, y_base + o);
                            }
                        }
                    }
                }
            }
        }
    }

    fn candidates(&self) -> Vec<AlgorithmCandidate<HostAlgorithm>> {
        vec![
            AlgorithmCandidate {
                algo: HostAlgorithm::Scatter,
                succeeded: true,
                workspace_bytes: 0,
                deterministic: false,
            },
            AlgorithmCandidate {
                algo: HostAlgorithm::Unrolled,
                succeeded: true,
                workspace_bytes: self.unrolled_bytes(),
                deterministic: true,
            },
            AlgorithmCandidate {
                algo: HostAlgorithm::Direct,
                succeeded: true,
                workspace_bytes: 0,
                deterministic: true,
            },
        ]
    }

    fn check_workspace(&self, call: &'static str, algo: HostAlgorithm, limit: usize) -> Result<()> {
        if algo == HostAlgorithm::Unrolled && self.unrolled_bytes() > limit {
            return Err(Error::native(
                call,
                format!(
                    "NOT_SUPPORTED: algorithm needs {} workspace bytes, {limit} available",
                    self.unrolled_bytes()
                ),
            ));
        }
        Ok(())
    }
}

impl HostConvLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> HostStats {
        let s = &self.state;
        HostStats {
            live_descriptors: self.slots().len(),
            forward_queries: s.forward_queries.load(Ordering::Relaxed),
            backward_data_queries: s.backward_data_queries.load(Ordering::Relaxed),
            backward_filter_queries: s.backward_filter_queries.load(Ordering::Relaxed),
            compute_calls: s.compute_calls.load(Ordering::Relaxed),
        }
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<u64, Slot>> {
        self.state.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn create(&self, slot: Slot) -> HostHandle {
        let id = self.state.next_handle.fetch_add(1, Ordering::Relaxed);
        self.slots().insert(id, slot);
        HostHandle(id)
    }

    fn destroy(&self, call: &'static str, handle: HostHandle, matches: fn(&Slot) -> bool) -> Result<()> {
        let mut slots = self.slots();
        match slots.get(&handle.0).map(matches) {
            Some(true) => {
                slots.remove(&handle.0);
                Ok(())
            }
            Some(false) => Err(bad_param(call, format!("{handle:?} has another descriptor type"))),
            None => Err(bad_param(call, format!("{handle:?} is not a live descriptor"))),
        }
    }

    fn with_slot<T>(
        &self,
        call: &'static str,
        handle: HostHandle,
        f: impl FnOnce(&mut Slot) -> Option<T>,
    ) -> Result<T> {
        let mut slots = self.slots();
        let slot = slots
            .get_mut(&handle.0)
            .ok_or_else(|| bad_param(call, format!("{handle:?} is not a live descriptor")))?;
        f(slot).ok_or_else(|| bad_param(call, format!("{handle:?} has the wrong type or is unset")))
    }

    fn count(&self, counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn problem(
        &self,
        call: &'static str,
        x: HostHandle,
        w: HostHandle,
        conv: HostHandle,
        y: HostHandle,
    ) -> Result<Problem> {
        let x = self.get_tensor(x)?;
        let w = self.get_filter(w)?;
        let conv = self.get_convolution(conv)?;
        let y = self.get_tensor(y)?;
        Problem::resolve(call, &x, &w, &conv, &y)
    }
}

impl ConvLibrary for HostConvLibrary {
    type Filter = HostHandle;
    type Convolution = HostHandle;
    type Tensor = HostHandle;
    type FwdAlgo = HostAlgorithm;
    type BwdDataAlgo = HostAlgorithm;
    type BwdFilterAlgo = HostAlgorithm;

    fn create_filter(&self) -> Result<HostHandle> {
        Ok(self.create(Slot::Filter(None)))
    }

    fn set_filter(&self, desc: HostHandle, params: &FilterParams) -> Result<()> {
        self.with_slot("set_filter", desc, |slot| match slot {
            Slot::Filter(p) => {
                *p = Some(params.clone());
                Some(())
            }
            _ => None,
        })
    }

    fn get_filter(&self, desc: HostHandle) -> Result<FilterParams> {
        self.with_slot("get_filter", desc, |slot| match slot {
            Slot::Filter(p) => p.clone(),
            _ => None,
        })
    }

    fn destroy_filter(&self, desc: HostHandle) -> Result<()> {
        self.destroy("destroy_filter", desc, |s| matches!(s, Slot::Filter(_)))
    }

    fn create_convolution(&self) -> Result<HostHandle> {
        Ok(self.create(Slot::Convolution(None)))
    }

    fn set_convolution(&self, desc: HostHandle, params: &ConvolutionParams) -> Result<()> {
        self.with_slot("set_convolution", desc, |slot| match slot {
            Slot::Convolution(p) => {
                *p = Some(params.clone());
                Some(())
            }
            _ => None,
        })
    }

    fn get_convolution(&self, desc: HostHandle) -> Result<ConvolutionParams> {
        self.with_slot("get_convolution", desc, |slot| match slot {
            Slot::Convolution(p) => p.clone(),
            _ => None,
        })
    }

    fn destroy_convolution(&self, desc: HostHandle) -> Result<()> {
        self.destroy("destroy_convolution", desc, |s| matches!(s, Slot::Convolution(_)))
    }

    fn create_tensor(&self) -> Result<HostHandle> {
        Ok(self.create(Slot::Tensor(None)))
    }

    fn set_tensor(&self, desc: HostHandle, params: &TensorParams) -> Result<()> {
        self.with_slot("set_tensor", desc, |slot| match slot {
            Slot::Tensor(p) => {
                *p = Some(params.clone());
                Some(())
            }
            _ => None,
        })
    }

    fn get_tensor(&self, desc: HostHandle) -> Result<TensorParams> {
        self.with_slot("get_tensor", desc, |slot| match slot {
            Slot::Tensor(p) => p.clone(),
            _ => None,
        })
    }

    fn destroy_tensor(&self, desc: HostHandle) -> Result<()> {
        self.destroy("destroy_tensor", desc, |s| matches!(s, Slot::Tensor(_)))
    }

    fn find_forward_algorithms(
        &self,
        x: HostHandle,
        w: HostHandle,
        conv: HostHandle,
        y: HostHandle,
    ) -> Result<Vec<AlgorithmCandidate<HostAlgorithm>>> {
        self.count(&self.state.forward_queries);
        Ok(self.problem("find_forward_algorithms", x, w, conv, y)?.candidates())
    }

    fn find_backward_data_algorithms(
        &self,
        w: HostHandle,
        dy: HostHandle,
        conv: HostHandle,
        dx: HostHandle,
    ) -> Result<Vec<AlgorithmCandidate<HostAlgorithm>>> {
        self.count(&self.state.backward_data_queries);
        Ok(self.problem("find_backward_data_algorithms", dx, w, conv, dy)?.candidates())
    }

    fn find_backward_filter_algorithms(
        &self,
        x: HostHandle,
        dy: HostHandle,
        conv: HostHandle,
        dw: HostHandle,
    ) -> Result<Vec<AlgorithmCandidate<HostAlgorithm>>> {
        self.count(&self.state.backward_filter_queries);
        Ok(self.problem("find_backward_filter_algorithms", x, dw, conv, dy)?.candidates())
    }

    fn convolution_forward(
        &self,
        alpha: DataType,
        x_desc: HostHandle,
        x: &[DataType],
        w_desc: HostHandle,
        w: &[DataType],
        conv: HostHandle,
        algo: HostAlgorithm,
        workspace_limit: usize,
        beta: DataType,
        y_desc: HostHandle,
        y: &mut [DataType],
    ) -> Result<()> {
        const CALL: &str = "convolution_forward";
        self.count(&self.state.compute_calls);
        let p = self.problem(CALL, x_desc, w_desc, conv, y_desc)?;
        p.check_workspace(CALL, algo, workspace_limit)?;
        check_len(CALL, "x", x.len(), p.x_len())?;
        check_len(CALL, "w", w.len(), p.w_len())?;
        check_len(CALL, "y", y.len(), p.y_len())?;

        let mut out = vec![0.0; y.len()];
        p.for_each_tap(|xi, wi, yi| out[yi] += x[xi] * w[wi]);
        blend(y, &out, alpha, beta);
        Ok(())
    }

    fn convolution_backward_data(
        &self,
        alpha: DataType,
        w_desc: HostHandle,
        w: &[DataType],
        dy_desc: HostHandle,
        dy: &[DataType],
        conv: HostHandle,
        algo: HostAlgorithm,
        workspace_limit: usize,
        beta: DataType,
        dx_desc: HostHandle,
        dx: &mut [DataType],
    ) -> Result<()> {
        const CALL: &str = "convolution_backward_data";
        self.count(&self.state.compute_calls);
        let p = self.problem(CALL, dx_desc, w_desc, conv, dy_desc)?;
        p.check_workspace(CALL, algo, workspace_limit)?;
        check_len(CALL, "w", w.len(), p.w_len())?;
        check_len(CALL, "dy", dy.len(), p.y_len())?;
        check_len(CALL, "dx", dx.len(), p.x_len())?;

        let mut grad = vec![0.0; dx.len()];
        p.for_each_tap(|xi, wi, yi| grad[xi] += dy[yi] * w[wi]);
        blend(dx, &grad, alpha, beta);
        Ok(())
    }

    fn convolution_backward_filter(
        &self,
        alpha: DataType,
        x_desc: HostHandle,
        x: &[DataType],
        dy_desc: HostHandle,
        dy: &[DataType],
        conv: HostHandle,
        algo: HostAlgorithm,
        workspace_limit: usize,
        beta: DataType,
        dw_desc: HostHandle,
        dw: &mut [DataType],
    ) -> Result<()> {
        const CALL: &str = "convolution_backward_filter";
        self.count(&self.state.compute_calls);
        let p = self.problem(CALL, x_desc, dw_desc, conv, dy_desc)?;
        p.check_workspace(CALL, algo, workspace_limit)?;
        check_len(CALL, "x", x.len(), p.x_len())?;
        check_len(CALL, "dy", dy.len(), p.y_len())?;
        check_len(CALL, "dw", dw.len(), p.w_len())?;

        let mut grad = vec![0.0; dw.len()];
        p.for_each_tap(|xi, wi, yi| grad[wi] += x[xi] * dy[yi]);
        blend(dw, &grad, alpha, beta);
        Ok(())
    }

    fn convolution_backward_bias(
        &self,
        alpha: DataType,
        dy_desc: HostHandle,
        dy: &[DataType],
        beta: DataType,
        db_desc: HostHandle,
        db: &mut [DataType],
    ) -> Result<()> {
        const CALL: &str = "convolution_backward_bias";
        self.count(&self.state.compute_calls);
        let dy_params = self.get_tensor(dy_desc)?;
        let db_params = self.get_tensor(db_desc)?;
        let (batch, channels) = channel_layout(CALL, &dy_params, &db_params)?;
        check_len(CALL, "dy", dy.len(), dy_params.elem_count())?;
        check_len(CALL, "db", db.len(), channels)?;

        let volume = dy.len() / (batch * channels).max(1);
        let mut sums = vec![0.0; channels];
        for (i, block) in dy.chunks(volume.max(1)).enumerate() {
            sums[i % channels] += block.iter().sum::<DataType>();
        }
        blend(db, &sums, alpha, beta);
        Ok(())
    }

    fn add_tensor(
        &self,
        alpha: DataType,
        a_desc: HostHandle,
        a: &[DataType],
        beta: DataType,
        c_desc: HostHandle,
        c: &mut [DataType],
    ) -> Result<()> {
        const CALL: &str = "add_tensor";
        self.count(&self.state.compute_calls);
        let c_params = self.get_tensor(c_desc)?;
        let a_params = self.get_tensor(a_desc)?;
        let (batch, channels) = channel_layout(CALL, &c_params, &a_params)?;
        check_len(CALL, "a", a.len(), channels)?;
        check_len(CALL, "c", c.len(), c_params.elem_count())?;

        let volume = c.len() / (batch * channels).max(1);
        for (i, block) in c.chunks_mut(volume.max(1)).enumerate() {
            let term = alpha * a[i % channels];
            for v in block {
                *v = if beta == 0.0 { term } else { term + beta * *v };
            }
        }
        Ok(())
    }
}

/// `(N, C)` of a full tensor whose per-channel companion is `[1, C, 1, ...]`.
fn channel_layout(
    call: &'static str,
    full: &TensorParams,
    per_channel: &TensorParams,
) -> Result<(usize, usize)> {
    let ok = full.dims.len() >= 2
        && per_channel.dims.len() == full.dims.len()
        && per_channel.dims[1] == full.dims[1]
        && per_channel
            .dims
            .iter()
            .enumerate()
            .all(|(i, &d)| i == 1 || d == 1);
    if !ok {
        return Err(bad_param(
            call,
            format!(
                "cannot broadcast {:?} over {:?} per channel",
                per_channel.dims, full.dims
            ),
        ));
    }
    Ok((full.dims[0], full.dims[1]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accel::library::{ConvolutionMode, NativeDataType, TensorFormat};

    fn setup(
        lib: &HostConvLibrary,
        x: Vec<usize>,
        w: Vec<usize>,
        pads: Vec<usize>,
        dilations: Vec<usize>,
        groups: usize,
        y: Vec<usize>,
    ) -> Result<(HostHandle, HostHandle, HostHandle, HostHandle)> {
        let rank = pads.len();
        let xd = lib.create_tensor()?;
        lib.set_tensor(xd, &TensorParams::packed(x))?;
        let wd = lib.create_filter()?;
        lib.set_filter(
            wd,
            &FilterParams {
                data_type: NativeDataType::Float,
                format: TensorFormat::Nchw,
                dims: w,
            },
        )?;
        let cd = lib.create_convolution()?;
        lib.set_convolution(
            cd,
            &ConvolutionParams {
                pads,
                strides: vec![1; rank],
                dilations,
                mode: ConvolutionMode::CrossCorrelation,
                data_type: NativeDataType::Float,
                groups,
            },
        )?;
        let yd = lib.create_tensor()?;
        lib.set_tensor(yd, &TensorParams::packed(y))?;
        Ok((xd, wd, cd, yd))
    }

    #[test]
    fn dilated_forward() -> Result<()> {
        let lib = HostConvLibrary::new();
        // length 5, kernel [1, 1] dilated by 2: y[o] = x[o] + x[o + 2]
        let (x, w, c, y) = setup(&lib, vec![1, 1, 5], vec![1, 1, 2], vec![0], vec![2], 1, vec![1, 1, 3])?;
        let mut out = vec![0.0; 3];
        lib.convolution_forward(
            1.0,
            x,
            &[1.0, 2.0, 3.0, 4.0, 5.0],
            w,
            &[1.0, 1.0],
            c,
            HostAlgorithm::Direct,
            0,
            0.0,
            y,
            &mut out,
        )?;
        assert_eq!(out, vec![4.0, 6.0, 8.0]);
        Ok(())
    }

    #[test]
    fn grouped_forward_keeps_groups_apart() -> Result<()> {
        let lib = HostConvLibrary::new();
        // 2 channels, 2 groups, 1x1 kernels: channel k only sees channel k
        let (x, w, c, y) = setup(&lib, vec![1, 2, 2], vec![2, 1, 1], vec![0], vec![1], 2, vec![1, 2, 2])?;
        let mut out = vec![0.0; 4];
        lib.convolution_forward(
            1.0,
            x,
            &[1.0, 2.0, 10.0, 20.0],
            w,
            &[2.0, 3.0],
            c,
            HostAlgorithm::Scatter,
            0,
            0.0,
            y,
            &mut out,
        )?;
        assert_eq!(out, vec![2.0, 4.0, 30.0, 60.0]);
        Ok(())
    }

    #[test]
    fn unrolled_respects_workspace_limit() -> Result<()> {
        let lib = HostConvLibrary::new();
        let (x, w, c, y) = setup(&lib, vec![1, 1, 3], vec![1, 1, 2], vec![0], vec![1], 1, vec![1, 1, 2])?;
        let candidates = lib.find_forward_algorithms(x, w, c, y)?;
        assert_eq!(candidates.len(), 3);
        assert_eq!(candidates[1].workspace_bytes, 2 * 2 * 4);

        let mut out = vec![0.0; 2];
        let err = lib
            .convolution_forward(1.0, x, &[0.0; 3], w, &[0.0; 2], c, HostAlgorithm::Unrolled, 0, 0.0, y, &mut out)
            .unwrap_err();
        assert_eq!(err.kind(), kiln_core::ErrorKind::NativeCall);
        Ok(())
    }

    #[test]
    fn mismatched_output_extent_rejected() -> Result<()> {
        let lib = HostConvLibrary::new();
        let (x, w, c, y) = setup(&lib, vec![1, 1, 5], vec![1, 1, 3], vec![0], vec![1], 1, vec![1, 1, 4])?;
        assert!(lib.find_forward_algorithms(x, w, c, y).is_err());
        Ok(())
    }

    #[test]
    fn bias_reduction_and_broadcast() -> Result<()> {
        let lib = HostConvLibrary::new();
        let dy = lib.create_tensor()?;
        lib.set_tensor(dy, &TensorParams::packed(vec![2, 2, 3]))?;
        let db = lib.create_tensor()?;
        lib.set_tensor(db, &TensorParams::packed(vec![1, 2, 1]))?;

        let grad: Vec<DataType> = (0..12).map(|v| v as DataType).collect();
        let mut bias = vec![100.0, 100.0];
        lib.convolution_backward_bias(1.0, dy, &grad, 0.5, db, &mut bias)?;
        // channel 0: 0+1+2 + 6+7+8 = 24, channel 1: 3+4+5 + 9+10+11 = 42
        assert_eq!(bias, vec![74.0, 92.0]);

        let mut out = vec![1.0; 12];
        lib.add_tensor(2.0, db, &[1.0, -1.0], 1.0, dy, &mut out)?;
        assert_eq!(&out[0..6], &[3.0, 3.0, 3.0, -1.0, -1.0, -1.0]);
        Ok(())
    }

    #[test]
    fn destroy_tracks_live_descriptors() -> Result<()> {
        let lib = HostConvLibrary::new();
        let f = lib.create_filter()?;
        let t = lib.create_tensor()?;
        assert_eq!(lib.stats().live_descriptors, 2);
        assert!(lib.destroy_tensor(f).is_err());
        lib.destroy_filter(f)?;
        lib.destroy_tensor(t)?;
        assert_eq!(lib.stats().live_descriptors, 0);
        assert!(lib.destroy_tensor(t).is_err());
        Ok(())
    }
}
