//! Elementwise sum and product, used for gradient-descent updates.
//!
//! `Result` may be bound to either operand or both. The aliasing is resolved
//! on every evaluation, so rebinding between calls needs no new `init`
//! beyond the usual shape check.

use core::cell::Ref;

use crate::error::{Error, Result};
use crate::nn::{expect_shape, kernel_failed, Operator, Param};
use crate::ops::dispatch::{Device, Src};
use crate::tensors::{Tensor, TensorRef};

/// Shared `init` for both operators: every role has the same shape.
fn same_shape<D: Device>(
    operator: &'static str,
    a: &Param<D>,
    b: &Param<D>,
    result: &Param<D>,
) -> Result<usize> {
    let shape = a.shape(operator)?;
    expect_shape(operator, b.role(), &b.shape(operator)?, &shape)?;
    expect_shape(operator, result.role(), &result.shape(operator)?, &shape)?;
    Ok(shape.iter().product())
}

/// Borrows `operand` unless it is the result tensor itself.
fn operand<'a, D: Device>(
    operator: &'static str,
    operand: &'a Param<D>,
    result: &Param<D>,
    len: usize,
) -> Result<Option<Ref<'a, Tensor<D>>>> {
    if operand.same_as(result) {
        Ok(None)
    } else {
        operand.read(operator, len).map(Some)
    }
}

fn source<'a, D: Device>(
    operand: &'a Option<Ref<'_, Tensor<D>>>,
) -> Result<Src<'a, D::Buffer<f32>>> {
    match operand {
        Some(t) => Ok(Src::Buf(t.buffer()?)),
        None => Ok(Src::Dst),
    }
}

/// `Result = OperandA + rate · OperandB`.
///
/// ```rust
/// use pairgrad::nn::{ElementwiseAdd, Operator};
/// use pairgrad::ops::Cpu;
/// use pairgrad::tensors::Tensor;
///
/// let w = Tensor::<Cpu>::from_vec([2], vec![1.0, 2.0])?.into_ref();
/// let g = Tensor::<Cpu>::from_vec([2], vec![10.0, -10.0])?.into_ref();
/// let mut step = ElementwiseAdd::update(&w, &g);
/// step.set_rate(-0.1);
/// step.init()?;
/// step.evaluate()?;
/// assert_eq!(w.borrow().to_vec(), vec![0.0, 3.0]);
/// # Ok::<(), pairgrad::Error>(())
/// ```
pub struct ElementwiseAdd<D: Device> {
    pub operand_a: Param<D>,
    pub operand_b: Param<D>,
    pub result: Param<D>,
    rate: f32,
    len: Option<usize>,
}

impl<D: Device> ElementwiseAdd<D> {
    pub const NAME: &'static str = "ElementwiseAdd";

    pub fn new() -> Self {
        Self {
            operand_a: Param::required("OperandA"),
            operand_b: Param::required("OperandB"),
            result: Param::required("Result"),
            rate: 1.0,
            len: None,
        }
    }

    /// An in-place update `param ← param + rate · grad`; set the rate to
    /// `-learning_rate` for gradient descent.
    pub fn update(param: &TensorRef<D>, grad: &TensorRef<D>) -> Self {
        let mut add = Self::new();
        add.operand_a.bind(param);
        add.operand_b.bind(grad);
        add.result.bind(param);
        add
    }

    pub fn set_rate(&mut self, rate: f32) {
        self.rate = rate;
    }

    pub fn rate(&self) -> f32 {
        self.rate
    }
}

impl<D: Device> Default for ElementwiseAdd<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: Device> Operator for ElementwiseAdd<D> {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn init(&mut self) -> Result<()> {
        self.len = None;
        let len = same_shape(Self::NAME, &self.operand_a, &self.operand_b, &self.result)?;
        log::debug!("{}: initialized over {len} elements on {}", Self::NAME, D::KIND);
        self.len = Some(len);
        Ok(())
    }

    fn evaluate(&self) -> Result<()> {
        let len = self.len.ok_or(Error::NotInitialized {
            operator: Self::NAME,
        })?;
        log::trace!("{}: evaluate rate {}", Self::NAME, self.rate);

        let a = operand(Self::NAME, &self.operand_a, &self.result, len)?;
        let b = operand(Self::NAME, &self.operand_b, &self.result, len)?;
        let mut result = self.result.write(Self::NAME, len)?;
        D::add(source(&a)?, source(&b)?, self.rate, result.buffer_mut()?)
            .map_err(kernel_failed(Self::NAME))
    }
}

/// `Result = OperandA ⊙ OperandB`.
pub struct ElementwiseProduct<D: Device> {
    pub operand_a: Param<D>,
    pub operand_b: Param<D>,
    pub result: Param<D>,
    len: Option<usize>,
}

impl<D: Device> ElementwiseProduct<D> {
    pub const NAME: &'static str = "ElementwiseProduct";

    pub fn new() -> Self {
        Self {
            operand_a: Param::required("OperandA"),
            operand_b: Param::required("OperandB"),
            result: Param::required("Result"),
            len: None,
        }
    }
}

impl<D: Device> Default for ElementwiseProduct<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: Device> Operator for ElementwiseProduct<D> {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn init(&mut self) -> Result<()> {
        self.len = None;
        let len = same_shape(Self::NAME, &self.operand_a, &self.operand_b, &self.result)?;
        log::debug!("{}: initialized over {len} elements on {}", Self::NAME, D::KIND);
        self.len = Some(len);
        Ok(())
    }

    fn evaluate(&self) -> Result<()> {
        let len = self.len.ok_or(Error::NotInitialized {
            operator: Self::NAME,
        })?;
        log::trace!("{}: evaluate", Self::NAME);

        let a = operand(Self::NAME, &self.operand_a, &self.result, len)?;
        let b = operand(Self::NAME, &self.operand_b, &self.result, len)?;
        let mut result = self.result.write(Self::NAME, len)?;
        D::product(source(&a)?, source(&b)?, result.buffer_mut()?)
            .map_err(kernel_failed(Self::NAME))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::Cpu;

    fn tensor(data: Vec<f32>) -> TensorRef<Cpu> {
        let n = data.len();
        Tensor::from_vec([n], data).unwrap().into_ref()
    }

    #[test]
    fn add_into_distinct_result() {
        let a = tensor(vec![1.0, 2.0]);
        let b = tensor(vec![3.0, 4.0]);
        let r = tensor(vec![0.0; 2]);
        let mut add = ElementwiseAdd::<Cpu>::new();
        add.operand_a.bind(&a);
        add.operand_b.bind(&b);
        add.result.bind(&r);
        add.set_rate(0.5);
        add.init().unwrap();
        add.evaluate().unwrap();
        assert_eq!(r.borrow().to_vec(), vec![2.5, 4.0]);
        assert_eq!(a.borrow().to_vec(), vec![1.0, 2.0]);
    }

    #[test]
    fn product_squares_in_place() {
        let a = tensor(vec![-3.0, 0.5]);
        let mut mul = ElementwiseProduct::<Cpu>::new();
        mul.operand_a.bind(&a);
        mul.operand_b.bind(&a);
        mul.result.bind(&a);
        mul.init().unwrap();
        mul.evaluate().unwrap();
        assert_eq!(a.borrow().to_vec(), vec![9.0, 0.25]);
    }

    #[test]
    fn update_repeats_without_reinit() {
        let w = tensor(vec![1.0, 1.0]);
        let g = tensor(vec![1.0, -1.0]);
        let mut step = ElementwiseAdd::update(&w, &g);
        step.set_rate(-0.25);
        step.init().unwrap();
        step.evaluate().unwrap();
        step.evaluate().unwrap();
        assert_eq!(w.borrow().to_vec(), vec![0.5, 1.5]);
    }

    #[test]
    fn shapes_must_match_exactly() {
        let mut add = ElementwiseAdd::<Cpu>::new();
        add.operand_a.bind(&Tensor::from_vec([2, 2], vec![0.0; 4]).unwrap().into_ref());
        add.operand_b.bind(&Tensor::from_vec([4], vec![0.0; 4]).unwrap().into_ref());
        add.result.bind(&tensor(vec![0.0; 4]));
        assert!(matches!(
            add.init(),
            Err(Error::ShapeMismatch { role: "OperandB", .. })
        ));
    }
}
