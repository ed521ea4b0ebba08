//! Integration tests for autodiff module.
//!
//! Tests backward-mode automatic differentiation with numerical gradient checks.

use approx::assert_relative_eq;
use orchard_tensor::{Device, Tensor, TensorError};

/// Compute numerical gradient using central difference.
///
/// grad_i ≈ (f(x + eps*e_i) - f(x - eps*e_i)) / (2*eps)
fn numerical_gradient<F>(f: F, x: &[f32], eps: f32) -> Vec<f32>
where
    F: Fn(&[f32]) -> f32,
{
    let mut grad = vec![0.0; x.len()];
    let mut x_plus = x.to_vec();
    let mut x_minus = x.to_vec();

    for i in 0..x.len() {
        x_plus[i] = x[i] + eps;
        x_minus[i] = x[i] - eps;

        let f_plus = f(&x_plus);
        let f_minus = f(&x_minus);
        grad[i] = (f_plus - f_minus) / (2.0 * eps);

        x_plus[i] = x[i];
        x_minus[i] = x[i];
    }
    grad
}

fn leaf(data: &[f32], shape: &[usize]) -> Tensor {
    let t = Tensor::from_slice(data, shape, Device::Cpu).unwrap();
    t.set_requires_grad(true);
    t
}

fn constant(data: &[f32], shape: &[usize]) -> Tensor {
    Tensor::from_slice(data, shape, Device::Cpu).unwrap()
}

fn assert_close(actual: &[f32], expected: &[f32], epsilon: f32) {
    assert_eq!(actual.len(), expected.len());
    for (a, e) in actual.iter().zip(expected) {
        assert_relative_eq!(*a, *e, epsilon = epsilon);
    }
}

#[test]
fn test_matmul_sum_gradients() {
    let a = leaf(&[1.0, 2.0, 3.0, 4.0], &[2, 2]);
    let b = leaf(&[5.0, 6.0, 7.0, 8.0], &[2, 2]);

    let loss = a.matmul(&b).unwrap().sum().unwrap();
    assert_eq!(loss.item().unwrap(), 134.0);
    loss.backward().unwrap();

    assert_eq!(a.grad().unwrap().to_vec(), vec![11.0, 15.0, 11.0, 15.0]);
    assert_eq!(b.grad().unwrap().to_vec(), vec![4.0, 4.0, 6.0, 6.0]);
}

#[test]
fn test_numerical_gradient_matmul() {
    let eps = 1e-1;

    // f(A) = mean((A @ B) * W) where A is 2x3, B is 3x4
    let a_data: Vec<f32> = (0..6).map(|i| (i as f32 + 1.0) * 0.1).collect();
    let b_data: Vec<f32> = (0..12).map(|i| (i as f32 - 5.0) * 0.2).collect();
    let w_data: Vec<f32> = (0..8).map(|i| 1.0 + 0.25 * i as f32).collect();

    let f = |x: &[f32]| -> f32 {
        let a = constant(x, &[2, 3]);
        let b = constant(&b_data, &[3, 4]);
        let w = constant(&w_data, &[2, 4]);
        a.matmul(&b).unwrap().mul(&w).unwrap().mean().unwrap().item().unwrap()
    };

    let a = leaf(&a_data, &[2, 3]);
    let b = constant(&b_data, &[3, 4]);
    let w = constant(&w_data, &[2, 4]);
    a.matmul(&b).unwrap().mul(&w).unwrap().mean().unwrap().backward().unwrap();

    let expected = numerical_gradient(f, &a_data, eps);
    assert_close(&a.grad().unwrap().to_vec(), &expected, 1e-3);
}

#[test]
fn test_numerical_gradient_broadcast_division() {
    let eps = 1e-2;
    let x_data = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
    let y_data = [2.0, 4.0, 8.0];

    // d/dy of sum(x / y) where y broadcasts over rows
    let f = |y: &[f32]| -> f32 {
        let x = constant(&x_data, &[2, 3]);
        let y = constant(y, &[3]);
        x.div(&y, false).unwrap().sum().unwrap().item().unwrap()
    };

    let x = leaf(&x_data, &[2, 3]);
    let y = leaf(&y_data, &[3]);
    x.div(&y, false).unwrap().sum().unwrap().backward().unwrap();

    assert_eq!(y.grad().unwrap().shape(), &[3]);
    assert_close(&y.grad().unwrap().to_vec(), &numerical_gradient(f, &y_data, eps), 1e-3);
    assert_close(&x.grad().unwrap().to_vec(), &[0.5, 0.25, 0.125, 0.5, 0.25, 0.125], 1e-6);
}

#[test]
fn test_diamond_graph_accumulates_both_paths() {
    let x = leaf(&[1.0, 2.0, 3.0], &[3]);
    let y = x.mul_scalar(2.0).unwrap();
    let loss = y.add(&y).unwrap().sum().unwrap();
    loss.backward().unwrap();
    assert_eq!(x.grad().unwrap().to_vec(), vec![4.0, 4.0, 4.0]);
}

#[test]
fn test_shared_input_across_branches() {
    // loss = sum(x * x + x) => dloss/dx = 2x + 1
    let x = leaf(&[1.0, -2.0, 0.5], &[3]);
    let loss = x.mul(&x).unwrap().add(&x).unwrap().sum().unwrap();
    loss.backward().unwrap();
    assert_close(&x.grad().unwrap().to_vec(), &[3.0, -3.0, 2.0], 1e-6);
}

#[test]
fn test_gradients_accumulate_across_passes() {
    let x = leaf(&[1.0, 2.0], &[2]);
    for _ in 0..3 {
        x.mul_scalar(2.0).unwrap().sum().unwrap().backward().unwrap();
    }
    assert_eq!(x.grad().unwrap().to_vec(), vec![6.0, 6.0]);
    x.zero_grad();
    assert!(x.grad().is_none());
}

#[test]
fn test_in_place_division_chain() {
    let t = leaf(&[2.0, 4.0], &[2]);
    let y = t.mul_scalar(1.0).unwrap();
    y.div_(2.0, false).unwrap();
    y.div_(4.0, false).unwrap();
    assert_eq!(y.to_vec(), vec![0.25, 0.5]);
    assert_eq!(y.grad_fn().unwrap().name(), "DivScalarBackward");

    y.sum().unwrap().backward().unwrap();
    assert_eq!(t.grad().unwrap().to_vec(), vec![0.125, 0.125]);
}

#[test]
fn test_in_place_division_on_leaf() {
    let t = leaf(&[2.0, 4.0], &[2]);
    t.div_(2.0, false).unwrap();
    assert_eq!(t.to_vec(), vec![1.0, 2.0]);
    assert!(!t.is_leaf());
    t.sum().unwrap().backward().unwrap();
    assert_eq!(t.grad().unwrap().to_vec(), vec![0.5, 0.5]);
}

#[test]
fn test_in_place_division_by_zero() {
    let t = leaf(&[1.0, 2.0], &[2]);
    assert!(matches!(t.div_(0.0, false), Err(TensorError::DivideByZero)));
    assert_eq!(t.to_vec(), vec![1.0, 2.0]);

    t.div_(0.0, true).unwrap();
    assert_eq!(t.to_vec(), vec![0.0, 0.0]);
    t.sum().unwrap().backward().unwrap();
    assert_eq!(t.grad().unwrap().to_vec(), vec![0.0, 0.0]);
}

#[test]
fn test_safe_division_zero_divisor_gradient() {
    let x = leaf(&[1.0, 2.0], &[2]);
    let y = leaf(&[0.0, 2.0], &[2]);
    let q = x.div(&y, true).unwrap();
    assert_eq!(q.to_vec(), vec![0.0, 1.0]);
    q.sum().unwrap().backward().unwrap();
    assert_eq!(x.grad().unwrap().to_vec(), vec![0.0, 0.5]);
    assert_eq!(y.grad().unwrap().to_vec(), vec![0.0, -0.5]);

    assert!(matches!(x.div(&y, false), Err(TensorError::DivideByZero)));
}

#[test]
fn test_detach_aliases_without_gradient() {
    let x = leaf(&[1.0, 2.0], &[2]);
    let d = x.detach();
    assert!(d.is_alias_of(&x));
    assert!(!d.requires_grad());

    let loss = d.mul_scalar(3.0).unwrap().sum().unwrap();
    assert!(!loss.requires_grad());
    loss.backward().unwrap();
    assert!(x.grad().is_none());
}

#[test]
fn test_deep_clone_is_differentiable_copy() {
    let x = leaf(&[1.0, 2.0], &[2]);
    let c = x.deep_clone().unwrap();
    assert!(!c.is_alias_of(&x));
    c.mul_scalar(3.0).unwrap().sum().unwrap().backward().unwrap();
    assert_eq!(x.grad().unwrap().to_vec(), vec![3.0, 3.0]);
}

#[test]
fn test_keepdim_matches_unsqueeze() {
    let data: Vec<f32> = (1..=12).map(|v| v as f32).collect();
    let t = constant(&data, &[3, 4]);
    for dim in 0..2 {
        let kept = t.sum_dim(dim, true).unwrap();
        let squeezed = t.sum_dim(dim, false).unwrap().unsqueeze(dim).unwrap();
        assert_eq!(kept.shape(), squeezed.shape());
        assert_eq!(kept.to_vec(), squeezed.to_vec());
    }
}

#[test]
fn test_mean_dim_gradient() {
    let x = leaf(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]);
    let weights = constant(&[1.0, 2.0], &[2]);
    x.mean_dim(1, false)
        .unwrap()
        .mul(&weights)
        .unwrap()
        .sum()
        .unwrap()
        .backward()
        .unwrap();
    let third = 1.0 / 3.0;
    assert_close(
        &x.grad().unwrap().to_vec(),
        &[third, third, third, 2.0 * third, 2.0 * third, 2.0 * third],
        1e-6,
    );
}

#[test]
fn test_slice_then_view_gradient() {
    let x = leaf(&(0..8).map(|v| v as f32).collect::<Vec<_>>(), &[2, 4]);
    let s = x.slice(1, 1, 3, 1).unwrap().contiguous().unwrap();
    let v = s.view(&[4]).unwrap();
    let weights = constant(&[1.0, 2.0, 3.0, 4.0], &[4]);
    v.mul(&weights).unwrap().sum().unwrap().backward().unwrap();
    assert_eq!(
        x.grad().unwrap().to_vec(),
        vec![0.0, 1.0, 2.0, 0.0, 0.0, 3.0, 4.0, 0.0]
    );
}

#[test]
fn test_custom_seed_on_intermediate() {
    let x = leaf(&[1.0, 2.0], &[2]);
    let y = x.mul_scalar(2.0).unwrap();
    y.set_grad(Some(constant(&[0.5, -1.0], &[2]))).unwrap();
    y.backward().unwrap();
    assert_eq!(x.grad().unwrap().to_vec(), vec![1.0, -2.0]);

    assert!(matches!(
        y.set_grad(Some(constant(&[1.0], &[1]))),
        Err(TensorError::ShapeMismatch { .. })
    ));
}
