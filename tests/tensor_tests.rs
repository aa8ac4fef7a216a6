use pairgrad::backend::{self, Backend};
use pairgrad::ops::{Cpu, DType, Device};
use pairgrad::tensors::{Tensor, INIT_RANGE};
use pairgrad::Error;

#[test]
fn test_tensor_creation() {
    let mut t = Tensor::<Cpu>::new([2, 3]);
    assert_eq!(t.shape(), &[2, 3]);
    assert_eq!(t.len(), 6);
    assert!(!t.is_initialized());
    t.init().unwrap();
    assert_eq!(t.to_vec(), vec![0.0; 6]);
    assert_eq!(t.dtype(), DType::F32);
}

#[test]
fn test_reshape_round_trip_keeps_data() {
    let data: Vec<f32> = (0..24).map(|v| v as f32).collect();
    let mut t = Tensor::<Cpu>::from_vec([2, 3, 2, 2], data.clone()).unwrap();
    t.reshape([12, 2]).unwrap();
    assert_eq!(t.shape(), &[12, 2]);
    assert_eq!(t[13], 13.0);
    t.reshape([2, 3, 2, 2]).unwrap();
    assert_eq!(t.to_vec(), data);
}

#[test]
fn test_reshape_rejects_count_change() {
    let mut t = Tensor::<Cpu>::from_vec([2, 2], vec![1.0; 4]).unwrap();
    let err = t.reshape([5]).unwrap_err();
    assert!(matches!(err, Error::Reshape { .. }));
    assert_eq!(t.shape(), &[2, 2]);
}

#[test]
fn test_first_axis_fastest_layout() {
    // (c, x, y, n) of a [2, 3, 2, 2] tensor
    let t = Tensor::<Cpu>::from_vec([2, 3, 2, 2], (0..24).map(|v| v as f32).collect()).unwrap();
    let at = |c: usize, x: usize, y: usize, n: usize| t[c + 2 * (x + 3 * (y + 2 * n))];
    assert_eq!(at(1, 0, 0, 0), 1.0);
    assert_eq!(at(0, 1, 0, 0), 2.0);
    assert_eq!(at(0, 0, 1, 0), 6.0);
    assert_eq!(at(1, 2, 1, 1), 23.0);
}

#[test]
fn test_index_mut_and_transfers_are_noops_on_cpu() {
    let mut t = Tensor::<Cpu>::new([3]);
    t.init().unwrap();
    t[1] = 4.5;
    t.copy_from_host_to_device().unwrap();
    t.copy_from_device_to_host().unwrap();
    assert_eq!(t.as_slice(), &[0.0, 4.5, 0.0]);
}

#[test]
fn test_randomize_stays_in_range() {
    let mut t = Tensor::<Cpu>::new([50, 20]);
    t.init().unwrap();
    t.randomize().unwrap();
    assert!(t.as_slice().iter().all(|v| v.abs() <= INIT_RANGE));
}

#[test]
fn test_init_is_idempotent() {
    let mut t = Tensor::<Cpu>::from_vec([2], vec![1.0, 2.0]).unwrap();
    t.init().unwrap();
    assert_eq!(t.to_vec(), vec![1.0, 2.0]);
}

#[test]
fn test_backend_reporting() {
    assert_eq!(Cpu::KIND, Backend::Cpu);
    assert!(Cpu::KIND.is_host());
    assert_eq!(backend::available().first(), Some(&Backend::Cpu));
    let t = Tensor::<Cpu>::new([1]);
    assert!(format!("{t:?}").contains("Cpu"));
}
