/// Symmetric finite-difference gradient of `function` at `x`.
///
/// Each component uses a central difference with step `step` so the
/// truncation error is second order in the step size. The callback is
/// evaluated `2 * x.len()` times and never at `x` itself.
pub fn numerical_gradient(
    function: &mut dyn FnMut(&[f64]) -> f64,
    x: &[f64],
    step: f64,
) -> Vec<f64> {
    let mut gradient = Vec::with_capacity(x.len());
    let mut point = x.to_vec();
    for index in 0..x.len() {
        point[index] = x[index] + step;
        let forward = function(&point);
        point[index] = x[index] - step;
        let backward = function(&point);
        point[index] = x[index];
        gradient.push((forward - backward) / (2.0 * step));
    }
    gradient
}
