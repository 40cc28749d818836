//! Finite difference stencils.
//!
//! A [`Stencil`] lists every point a derivative formula needs, with steps
//! `h_i` per parameter and bounds handled by switching to one-sided formulas.
//! Points are evaluated once each, in stencil order, and combined into an
//! array whose leading axes are the parameter axes.

use std::collections::HashMap;

use nalgebra::DVector;
use ndarray::{ArrayD, Axis, IxDyn};

use crate::{DerivativeError, DerivativeResult};

/// Offset of a point from the base, as multiples of each step. Sorted by
/// parameter index, zero multiples omitted.
pub type Offsets = Vec<(usize, i32)>;

#[derive(Debug, Clone)]
struct Term {
    /// Parameter index (first derivative) or index pair (second derivative).
    at: (usize, usize),
    /// `(point, weight)` pairs.
    weights: Vec<(usize, f64)>,
}

#[derive(Debug, Clone)]
pub struct Stencil {
    base: DVector<f64>,
    steps: DVector<f64>,
    order: u8,
    offsets: Vec<Offsets>,
    points: Vec<DVector<f64>>,
    terms: Vec<Term>,
}

/// Direction of a one-parameter step that stays inside the bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Room {
    Both,
    Forward,
    Backward,
}

struct Builder<'a> {
    base: &'a DVector<f64>,
    steps: &'a DVector<f64>,
    bounds: &'a [[f64; 2]],
    index: HashMap<Offsets, usize>,
    offsets: Vec<Offsets>,
    points: Vec<DVector<f64>>,
    terms: Vec<Term>,
}

impl<'a> Builder<'a> {
    fn new(base: &'a DVector<f64>, steps: &'a DVector<f64>, bounds: &'a [[f64; 2]]) -> Self {
        Self {
            base,
            steps,
            bounds,
            index: HashMap::new(),
            offsets: Vec::new(),
            points: Vec::new(),
            terms: Vec::new(),
        }
    }

    fn point(&mut self, offsets: &[(usize, i32)]) -> usize {
        let mut key: Offsets = offsets.iter().copied().filter(|(_, m)| *m != 0).collect();
        key.sort_unstable();
        if let Some(&i) = self.index.get(&key) {
            return i;
        }
        let mut x = self.base.clone();
        for &(i, m) in &key {
            x[i] += f64::from(m) * self.steps[i];
        }
        let i = self.points.len();
        self.index.insert(key.clone(), i);
        self.offsets.push(key);
        self.points.push(x);
        i
    }

    fn fits(&self, i: usize, multiple: i32) -> bool {
        let x = self.base[i] + f64::from(multiple) * self.steps[i];
        let [lower, upper] = self.bounds[i];
        x >= lower && x <= upper
    }

    fn room(&self, i: usize, reach: i32) -> DerivativeResult<Room> {
        match (self.fits(i, reach), self.fits(i, -reach)) {
            (true, true) => Ok(Room::Both),
            (true, false) => Ok(Room::Forward),
            (false, true) => Ok(Room::Backward),
            (false, false) => Err(DerivativeError::invalid(format!(
                "parameter {i}: step {} leaves the bounds {:?} in both directions",
                self.steps[i], self.bounds[i]
            ))),
        }
    }

    fn first(&mut self, i: usize, accuracy_order: u8) -> DerivativeResult<()> {
        let h = self.steps[i];
        let weights = match (accuracy_order, self.room(i, 1)?) {
            (1, Room::Both | Room::Forward) => {
                vec![(self.point(&[(i, 1)]), 1.0 / h), (self.point(&[]), -1.0 / h)]
            }
            (1, Room::Backward) => {
                vec![(self.point(&[]), 1.0 / h), (self.point(&[(i, -1)]), -1.0 / h)]
            }
            (_, Room::Both) => vec![
                (self.point(&[(i, 1)]), 0.5 / h),
                (self.point(&[(i, -1)]), -0.5 / h),
            ],
            (_, Room::Forward) => self.one_sided_first(i, 1)?,
            (_, Room::Backward) => self.one_sided_first(i, -1)?,
        };
        self.terms.push(Term { at: (i, i), weights });
        Ok(())
    }

    /// Second order one-sided first derivative.
    fn one_sided_first(&mut self, i: usize, direction: i32) -> DerivativeResult<Vec<(usize, f64)>> {
        if !self.fits(i, 2 * direction) {
            return Err(DerivativeError::invalid(format!(
                "parameter {i}: one-sided second order step leaves the bounds {:?}",
                self.bounds[i]
            )));
        }
        let h = self.steps[i] * f64::from(direction);
        Ok(vec![
            (self.point(&[]), -1.5 / h),
            (self.point(&[(i, direction)]), 2.0 / h),
            (self.point(&[(i, 2 * direction)]), -0.5 / h),
        ])
    }

    fn diagonal(&mut self, i: usize) -> DerivativeResult<()> {
        let h2 = self.steps[i] * self.steps[i];
        let weights = match self.room(i, 1)? {
            Room::Both => vec![
                (self.point(&[(i, 1)]), 1.0 / h2),
                (self.point(&[]), -2.0 / h2),
                (self.point(&[(i, -1)]), 1.0 / h2),
            ],
            room => {
                let d = if room == Room::Forward { 1 } else { -1 };
                if !self.fits(i, 2 * d) {
                    return Err(DerivativeError::invalid(format!(
                        "parameter {i}: second derivative needs two steps inside {:?}",
                        self.bounds[i]
                    )));
                }
                vec![
                    (self.point(&[]), 1.0 / h2),
                    (self.point(&[(i, d)]), -2.0 / h2),
                    (self.point(&[(i, 2 * d)]), 1.0 / h2),
                ]
            }
        };
        self.terms.push(Term { at: (i, i), weights });
        Ok(())
    }

    fn mixed(&mut self, i: usize, j: usize, accuracy_order: u8) -> DerivativeResult<()> {
        let (room_i, room_j) = (self.room(i, 1)?, self.room(j, 1)?);
        let (hi, hj) = (self.steps[i], self.steps[j]);
        let weights = if accuracy_order >= 2 && room_i == Room::Both && room_j == Room::Both {
            let w = 0.25 / (hi * hj);
            vec![
                (self.point(&[(i, 1), (j, 1)]), w),
                (self.point(&[(i, 1), (j, -1)]), -w),
                (self.point(&[(i, -1), (j, 1)]), -w),
                (self.point(&[(i, -1), (j, -1)]), w),
            ]
        } else {
            let si = if room_i == Room::Backward { -1 } else { 1 };
            let sj = if room_j == Room::Backward { -1 } else { 1 };
            let w = 1.0 / (f64::from(si) * hi * f64::from(sj) * hj);
            vec![
                (self.point(&[(i, si), (j, sj)]), w),
                (self.point(&[(i, si)]), -w),
                (self.point(&[(j, sj)]), -w),
                (self.point(&[]), w),
            ]
        };
        self.terms.push(Term { at: (i, j), weights });
        Ok(())
    }

    fn finish(self, order: u8) -> Stencil {
        Stencil {
            base: self.base.clone(),
            steps: self.steps.clone(),
            order,
            offsets: self.offsets,
            points: self.points,
            terms: self.terms,
        }
    }
}

impl Stencil {
    /// Stencil of a first derivative with respect to every parameter.
    pub fn first_derivative(
        base: DVector<f64>,
        steps: DVector<f64>,
        bounds: &[[f64; 2]],
        accuracy_order: u8,
    ) -> DerivativeResult<Self> {
        check_inputs(&base, &steps, bounds)?;
        let mut builder = Builder::new(&base, &steps, bounds);
        for i in 0..base.len() {
            builder.first(i, accuracy_order)?;
        }
        Ok(builder.finish(1))
    }

    /// Stencil of all second derivatives, including mixed ones.
    pub fn second_derivative(
        base: DVector<f64>,
        steps: DVector<f64>,
        bounds: &[[f64; 2]],
        accuracy_order: u8,
    ) -> DerivativeResult<Self> {
        check_inputs(&base, &steps, bounds)?;
        let mut builder = Builder::new(&base, &steps, bounds);
        for i in 0..base.len() {
            builder.diagonal(i)?;
            for j in i + 1..base.len() {
                builder.mixed(i, j, accuracy_order)?;
            }
        }
        Ok(builder.finish(2))
    }

    pub fn base(&self) -> &DVector<f64> {
        &self.base
    }

    pub fn steps(&self) -> &DVector<f64> {
        &self.steps
    }

    pub fn order(&self) -> u8 {
        self.order
    }

    pub fn parameters_len(&self) -> usize {
        self.base.len()
    }

    /// Every point to evaluate, in evaluation order.
    pub fn points(&self) -> &[DVector<f64>] {
        &self.points
    }

    /// Offsets of [`Stencil::points`] from the base, as step multiples.
    pub fn offsets(&self) -> &[Offsets] {
        &self.offsets
    }

    /// Number of points differing from the base.
    pub fn perturbed_len(&self) -> usize {
        self.offsets.iter().filter(|o| !o.is_empty()).count()
    }

    /// Evaluate every point once, in order, and combine the values.
    ///
    /// All values must share one shape `S`; the result has shape `[n, S..]`
    /// for first and `[n, n, S..]` for second derivatives.
    pub fn combine<F>(&self, mut evaluate: F) -> DerivativeResult<ArrayD<f64>>
    where
        F: FnMut(usize, &DVector<f64>) -> DerivativeResult<ArrayD<f64>>,
    {
        let mut values: Vec<ArrayD<f64>> = Vec::with_capacity(self.points.len());
        for (i, point) in self.points.iter().enumerate() {
            let value = evaluate(i, point)?;
            if let Some(first) = values.first()
                && first.shape() != value.shape()
            {
                return Err(DerivativeError::invalid(format!(
                    "stencil point {i} has shape {:?}, expected {:?}",
                    value.shape(),
                    first.shape()
                )));
            }
            values.push(value);
        }

        let value_shape = values.first().map(|v| v.shape().to_vec()).unwrap_or_default();
        let n = self.parameters_len();
        let mut shape = vec![n; usize::from(self.order)];
        shape.extend_from_slice(&value_shape);
        let mut result = ArrayD::zeros(IxDyn(&shape));

        for term in &self.terms {
            let mut estimate = ArrayD::<f64>::zeros(IxDyn(&value_shape));
            for &(point, weight) in &term.weights {
                estimate.scaled_add(weight, &values[point]);
            }
            let (i, j) = term.at;
            if self.order == 1 {
                result.index_axis_mut(Axis(0), i).assign(&estimate);
            } else {
                result
                    .index_axis_mut(Axis(0), i)
                    .index_axis_move(Axis(0), j)
                    .assign(&estimate);
                result
                    .index_axis_mut(Axis(0), j)
                    .index_axis_move(Axis(0), i)
                    .assign(&estimate);
            }
        }
        Ok(result)
    }
}

fn check_inputs(base: &DVector<f64>, steps: &DVector<f64>, bounds: &[[f64; 2]]) -> DerivativeResult<()> {
    if steps.len() != base.len() || bounds.len() != base.len() {
        return Err(DerivativeError::invalid(format!(
            "{} parameters, {} steps and {} bounds",
            base.len(),
            steps.len(),
            bounds.len()
        )));
    }
    if let Some(i) = steps.iter().position(|h| !(h.is_finite() && *h > 0.0)) {
        return Err(DerivativeError::invalid(format!(
            "step of parameter {i} must be finite and > 0, got {}",
            steps[i]
        )));
    }
    if let Some(i) = (0..base.len()).find(|&i| !(bounds[i][0] <= base[i] && base[i] <= bounds[i][1])) {
        return Err(DerivativeError::invalid(format!(
            "parameter {i} = {} lies outside its bounds {:?}",
            base[i], bounds[i]
        )));
    }
    Ok(())
}
