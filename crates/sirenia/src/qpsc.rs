//! Gradient projection for goal functions with neighbor (closeness) terms.
//!
//! The goal function is
//!
//! ```text
//! f(x) = Σ w_i (x_i - d_i)² + Σ_(i,j) w_ij (x_i - x_j)²
//! ```
//!
//! which, up to a constant, is `x'Qx/2 + b'x` with the partial-derivative factor 2 folded into
//! the matrix cells:
//!
//! ```text
//! Q[i][i] = 2 (w_i + Σ_j w_ij)
//! Q[i][j] = -2 Σ w_ij          (duplicate pairs summed)
//! b[i]    = -2 w_i d_i
//! ```
//!
//! With diagonal scaling every variable gets `s_i = 1 / √Q_ii`, the system becomes
//! `Q' = SQS`, `b' = Sb`, and the solver works on `y = x / s` until [`Qpsc::complete`] maps
//! positions back.
//!
//! The solver keeps one instance and drives it once per solve:
//!
//! ```text
//! reset(); add_variable(v) for every variable; variables_complete()
//! loop {
//!     pre_project()   (false => converged)
//!     split + project
//!     post_project()  (false => no movement)
//! }
//! complete()
//! ```

use crate::params::Parameters;
use crate::variable::Variable;
use nalgebra::DVector;
use tracing::trace;

#[derive(Debug, Clone, Copy)]
struct MatrixCell {
    value: f64,
    column: usize,
}

/// Row-compressed symmetric matrix; every row holds at least its diagonal.
#[derive(Debug, Clone, Default)]
struct SparseMatrix {
    row_starts: Vec<usize>,
    cells: Vec<MatrixCell>,
}

impl SparseMatrix {
    fn rebuild(&mut self, rows: &[Vec<MatrixCell>]) {
        self.row_starts.clear();
        self.cells.clear();
        for row in rows {
            self.row_starts.push(self.cells.len());
            self.cells.extend_from_slice(row);
        }
        self.row_starts.push(self.cells.len());
    }

    fn row(&self, row: usize) -> &[MatrixCell] {
        &self.cells[self.row_starts[row]..self.row_starts[row + 1]]
    }

    fn row_mut(&mut self, row: usize) -> &mut [MatrixCell] {
        &mut self.cells[self.row_starts[row]..self.row_starts[row + 1]]
    }

    fn rows(&self) -> usize {
        self.row_starts.len().saturating_sub(1)
    }

    fn mul_into(&self, rhs: &DVector<f64>, out: &mut DVector<f64>) {
        for row in 0..self.rows() {
            out[row] = self
                .row(row)
                .iter()
                .map(|cell| cell.value * rhs[cell.column])
                .sum();
        }
    }
}

/// Weight, scale and desired position at the time the variable joined; restored on completion.
#[derive(Debug, Clone, Copy)]
struct SavedVariable {
    weight: f64,
    scale: f64,
    desired_pos: f64,
}

#[derive(Debug, Clone)]
pub(crate) struct Qpsc {
    scale_in_qpsc: bool,
    convergence_epsilon: f64,
    convergence_quotient: f64,

    rows: Vec<Vec<MatrixCell>>,
    matrix: SparseMatrix,
    saved: Vec<Option<SavedVariable>>,
    /// `b`, then `b' = Sb` once scaled.
    wi_di: DVector<f64>,
    /// Dense accumulator used while assembling a row.
    row_scratch: Vec<f64>,
    row_touched: Vec<usize>,

    gradient: DVector<f64>,
    qg: DVector<f64>,
    prev_y: DVector<f64>,
    cur_y: DVector<f64>,

    is_first_project_call: bool,
    previous_function_value: f64,

    /// Goal-function value seen by every convergence check.
    #[cfg(test)]
    pub(crate) history: Vec<f64>,
}

fn reset_vector(v: &mut DVector<f64>, len: usize) {
    if v.len() == len {
        v.fill(0.0);
    } else {
        *v = DVector::zeros(len);
    }
}

impl Qpsc {
    pub(crate) fn new(params: &Parameters, variable_count: usize) -> Self {
        let mut qpsc = Self {
            scale_in_qpsc: true,
            convergence_epsilon: 0.0,
            convergence_quotient: 0.0,
            rows: Vec::new(),
            matrix: SparseMatrix::default(),
            saved: Vec::new(),
            wi_di: DVector::zeros(variable_count),
            row_scratch: Vec::new(),
            row_touched: Vec::new(),
            gradient: DVector::zeros(variable_count),
            qg: DVector::zeros(variable_count),
            prev_y: DVector::zeros(variable_count),
            cur_y: DVector::zeros(variable_count),
            is_first_project_call: true,
            previous_function_value: f64::MAX,
            #[cfg(test)]
            history: Vec::new(),
        };
        qpsc.reset(params, variable_count);
        qpsc
    }

    /// Prepares a new solve, keeping the buffers of earlier solves when the variable count is
    /// unchanged.
    pub(crate) fn reset(&mut self, params: &Parameters, variable_count: usize) {
        self.scale_in_qpsc = params.advanced.scale_in_qpsc;
        self.convergence_epsilon = params.qpsc_convergence_epsilon;
        self.convergence_quotient = params.qpsc_convergence_quotient;

        self.rows.iter_mut().for_each(Vec::clear);
        self.rows.resize_with(variable_count, Vec::new);
        self.saved.clear();
        self.saved.resize(variable_count, None);
        self.row_scratch.clear();
        self.row_scratch.resize(variable_count, 0.0);
        self.row_touched.clear();
        for v in [
            &mut self.wi_di,
            &mut self.gradient,
            &mut self.qg,
            &mut self.prev_y,
            &mut self.cur_y,
        ] {
            reset_vector(v, variable_count);
        }

        self.is_first_project_call = true;
        self.previous_function_value = f64::MAX;
        #[cfg(test)]
        self.history.clear();
    }

    /// Adds the matrix row of `var` and sets its working weight to 1 (the weight now lives in
    /// `Q` and `b`).
    ///
    /// # Panics
    ///
    /// Panics if the same variable is added twice.
    pub(crate) fn add_variable(&mut self, var: &mut Variable) {
        let ordinal = var.ordinal.0;
        assert!(
            self.saved[ordinal].is_none(),
            "variable {} was already added to the QPSC matrix",
            var.ordinal
        );
        self.is_first_project_call = true;
        self.wi_di[ordinal] = -2.0 * var.weight * var.desired_pos;

        self.touch(ordinal, var.weight);
        for nw in &var.neighbors {
            debug_assert_ne!(nw.neighbor, var.ordinal, "self-neighbors are rejected on insert");
            self.touch(ordinal, nw.weight);
            self.touch(nw.neighbor.0, -nw.weight);
        }

        self.row_touched.sort_unstable();
        self.row_touched.dedup();
        let row = &mut self.rows[ordinal];
        row.clear();
        for &column in &self.row_touched {
            let summed = std::mem::take(&mut self.row_scratch[column]);
            if summed != 0.0 {
                debug_assert_eq!(column == ordinal, summed > 0.0);
                row.push(MatrixCell {
                    value: 2.0 * summed,
                    column,
                });
            }
        }
        self.row_touched.clear();

        self.saved[ordinal] = Some(SavedVariable {
            weight: var.weight,
            scale: var.scale,
            desired_pos: var.desired_pos,
        });
        var.weight = 1.0;
    }

    fn touch(&mut self, column: usize, weight: f64) {
        self.row_scratch[column] += weight;
        self.row_touched.push(column);
    }

    /// Compresses the rows and applies diagonal scaling. Current positions become the desired
    /// positions.
    pub(crate) fn variables_complete(&mut self, vars: &mut [Variable]) {
        self.matrix.rebuild(&self.rows);

        for (ordinal, var) in vars.iter_mut().enumerate() {
            if self.scale_in_qpsc {
                let diagonal = self
                    .matrix
                    .row(ordinal)
                    .iter()
                    .find(|cell| cell.column == ordinal)
                    .map_or(0.0, |cell| cell.value);
                let scale = 1.0 / diagonal.abs().sqrt();
                var.scale = if scale.is_finite() { scale } else { 1.0 };
                self.wi_di[ordinal] *= var.scale;
            }
            self.cur_y[ordinal] = var.actual_pos;
            var.desired_pos = var.actual_pos;
        }

        if !self.scale_in_qpsc {
            return;
        }
        for row in 0..self.matrix.rows() {
            let row_scale = vars[row].scale;
            for cell in self.matrix.row_mut(row) {
                if cell.column == row {
                    cell.value = 1.0;
                } else {
                    cell.value *= row_scale * vars[cell.column].scale;
                }
            }
        }
    }

    /// Takes a steepest-descent step and writes it into the desired positions. Returns `false`
    /// once the goal function has converged or no step is possible.
    pub(crate) fn pre_project(&mut self, vars: &mut [Variable]) -> bool {
        if self.is_first_project_call {
            // Equality merges may have moved variables since `variables_complete`.
            for (ordinal, var) in vars.iter().enumerate() {
                self.cur_y[ordinal] = var.actual_pos;
            }
        }

        self.matrix.mul_into(&self.cur_y, &mut self.gradient);
        if self.has_converged() {
            return false;
        }
        self.gradient += &self.wi_di;

        let alpha_numerator = self.gradient.dot(&self.gradient);
        let mut alpha_denominator = 0.0;
        if alpha_numerator != 0.0 {
            self.matrix.mul_into(&self.gradient, &mut self.qg);
            alpha_denominator = self.qg.dot(&self.gradient);
        }
        if alpha_denominator == 0.0 {
            return false;
        }
        let alpha = alpha_numerator / alpha_denominator;
        trace!(alpha, f = self.previous_function_value, "qpsc gradient step");

        self.prev_y.copy_from(&self.cur_y);
        self.cur_y.axpy(-alpha, &self.gradient, 1.0);
        for (ordinal, var) in vars.iter_mut().enumerate() {
            var.desired_pos = self.cur_y[ordinal];
        }
        true
    }

    /// Moves the tracked position toward the projected one. Returns `false` when it did not move.
    pub(crate) fn post_project(&mut self, vars: &[Variable]) -> bool {
        // cur_y becomes p = prev_y - actual.
        for (ordinal, var) in vars.iter().enumerate() {
            self.cur_y[ordinal] = self.prev_y[ordinal] - var.actual_pos;
        }

        let beta_numerator = self.gradient.dot(&self.cur_y);
        let mut beta = 0.0;
        if beta_numerator != 0.0 {
            self.matrix.mul_into(&self.cur_y, &mut self.qg);
            let beta_denominator = self.qg.dot(&self.cur_y);
            beta = if beta_denominator == 0.0 {
                1.0
            } else {
                beta_numerator / beta_denominator
            };
            beta = beta.clamp(0.0, 1.0);
        }
        trace!(beta, "qpsc projected step");

        self.cur_y.axpy(1.0, &self.prev_y, -beta);
        self.is_first_project_call = false;
        beta > 0.0
    }

    /// Restores weights, desired positions and scales; positions are mapped back from the scaled
    /// space. Returns the last goal-function value.
    pub(crate) fn complete(&mut self, vars: &mut [Variable]) -> f64 {
        for (var, saved) in vars.iter_mut().zip(&self.saved) {
            let Some(saved) = saved else {
                continue;
            };
            var.weight = saved.weight;
            var.desired_pos = saved.desired_pos;
            if self.scale_in_qpsc {
                var.actual_pos *= var.scale;
                var.scale = saved.scale;
            }
        }
        self.previous_function_value
    }

    #[cfg(test)]
    fn function_value(&self) -> f64 {
        self.previous_function_value
    }

    /// Evaluates `f = (Q'y)·y / 2 + b'·y` (the gradient buffer holds `Q'y`) and compares it with
    /// the previous call.
    fn has_converged(&mut self) -> bool {
        let current = self.gradient.dot(&self.cur_y) / 2.0 + self.wi_di.dot(&self.cur_y);
        let mut converged = false;
        if !self.is_first_project_call {
            let diff = self.previous_function_value - current;
            let mut quotient = 0.0;
            if diff != 0.0 {
                let divisor = if self.previous_function_value != 0.0 {
                    self.previous_function_value
                } else {
                    current
                };
                quotient = (diff / divisor).abs();
            }
            converged =
                diff.abs() < self.convergence_epsilon || quotient < self.convergence_quotient;
        }
        self.previous_function_value = current;
        #[cfg(test)]
        self.history.push(current);
        converged
    }
}
