use crate::traits::{OdeSolver, OdeSystem, Tolerances};
use nalgebra::{DMatrix, DVector};

/// Length of the final step, clamped so the integration ends exactly at t = 1.
fn clamp_step(t: f64, h: f64) -> (f64, bool) {
    let left = 1.0 - t;
    if h >= left {
        (left, true)
    } else {
        (h, false)
    }
}

/// Fixed step forward Euler. Mostly useful as a reference.
#[derive(Debug, Clone, Copy, Default)]
pub struct Euler;

impl OdeSolver for Euler {
    fn name(&self) -> &'static str {
        "Euler"
    }

    fn workspace_size(&self, n: usize) -> usize {
        n
    }

    fn solve(
        &self,
        h: f64,
        x0: &mut [f64],
        workspace: &mut [f64],
        system: &mut dyn OdeSystem,
        _tolerances: Tolerances,
    ) {
        let dxdt = &mut workspace[..x0.len()];
        let mut t = 0.0;
        loop {
            let (step, done) = clamp_step(t, h);
            system.evaluate(x0, dxdt);
            for (x, d) in x0.iter_mut().zip(dxdt.iter()) {
                *x += step * d;
            }
            if done {
                break;
            }
            t += step;
        }
    }
}

/// Rational Runge-Kutta (Merson type) method with its own step control.
///
/// Each attempt evaluates five stages. The difference between the fourth and fifth order
/// estimates is checked per component against 0.0005 (relative when |x| >= 0.001); on
/// failure the step is halved and the attempt repeated. The step never goes below 1% of
/// the suggested step: at that floor the error check is switched off until the step grows
/// again, which guarantees termination.
///
/// Workspace layout: derivative, backup of x0, two blocks of stage sums.
#[derive(Debug, Clone, Copy, Default)]
pub struct IncaDascru;

impl OdeSolver for IncaDascru {
    fn name(&self) -> &'static str {
        "IncaDascru"
    }

    fn workspace_size(&self, n: usize) -> usize {
        4 * n
    }

    fn solve(
        &self,
        h: f64,
        x0: &mut [f64],
        workspace: &mut [f64],
        system: &mut dyn OdeSystem,
        _tolerances: Tolerances,
    ) {
        let n = x0.len();
        let (dxdt, rest) = workspace.split_at_mut(n);
        let (backup, rest) = rest.split_at_mut(n);
        let (stage1, rest) = rest.split_at_mut(n);
        let stage2 = &mut rest[..n];

        let hmin = 0.01 * h;
        let mut h = h;
        let mut t = 0.0;
        let mut error_control = true;
        let mut not_halved = true;
        let mut more = true;

        while more {
            let t_start = t;
            backup.copy_from_slice(x0);

            'attempt: loop {
                let mut well_within = true;
                if t + h - 1.0 >= 0.0 {
                    h = 1.0 - t;
                    more = false;
                }
                let h3 = h / 3.0;

                for stage in 0..5 {
                    system.evaluate(x0, dxdt);
                    for i in 0..n {
                        let mut q = h3 * dxdt[i];
                        let r = match stage {
                            0 => {
                                stage1[i] = q;
                                q
                            }
                            1 => 0.5 * (q + stage1[i]),
                            2 => {
                                let r = 3.0 * q;
                                stage2[i] = r;
                                0.375 * (r + stage1[i])
                            }
                            3 => {
                                let r = stage1[i] + 4.0 * q;
                                stage1[i] = r;
                                1.5 * (r - stage2[i])
                            }
                            _ => {
                                let r = 0.5 * (q + stage1[i]);
                                q = (r + r - 1.5 * (q + stage2[i])).abs();
                                r
                            }
                        };
                        x0[i] = backup[i] + r;

                        if stage == 4 {
                            let magnitude = x0[i].abs();
                            let tolerance = if magnitude >= 0.001 {
                                magnitude * 0.0005
                            } else {
                                0.0005
                            };
                            if q >= tolerance && error_control {
                                more = true;
                                not_halved = false;
                                h *= 0.5;
                                if h.abs() < hmin {
                                    h = hmin;
                                    error_control = false;
                                }
                                x0.copy_from_slice(backup);
                                t = t_start;
                                continue 'attempt;
                            }
                            if q >= 0.03125 * tolerance {
                                well_within = false;
                            }
                        }
                    }
                    match stage {
                        0 => t += h3,
                        2 => t += 0.5 * h3,
                        3 => t += 0.5 * h,
                        _ => {}
                    }
                }

                if well_within && not_halved && more {
                    h += h;
                    error_control = true;
                }
                not_halved = true;
                break;
            }
        }
    }
}

// --- Cash-Karp 5(4) ---

const CK_A2: [f64; 1] = [1.0 / 5.0];
const CK_A3: [f64; 2] = [3.0 / 40.0, 9.0 / 40.0];
const CK_A4: [f64; 3] = [3.0 / 10.0, -9.0 / 10.0, 6.0 / 5.0];
const CK_A5: [f64; 4] = [-11.0 / 54.0, 5.0 / 2.0, -70.0 / 27.0, 35.0 / 27.0];
const CK_A6: [f64; 5] = [
    1631.0 / 55296.0,
    175.0 / 512.0,
    575.0 / 13824.0,
    44275.0 / 110592.0,
    253.0 / 4096.0,
];
const CK_B5: [f64; 6] = [37.0 / 378.0, 0.0, 250.0 / 621.0, 125.0 / 594.0, 0.0, 512.0 / 1771.0];
const CK_B4: [f64; 6] = [
    2825.0 / 27648.0,
    0.0,
    18575.0 / 48384.0,
    13525.0 / 55296.0,
    277.0 / 14336.0,
    1.0 / 4.0,
];

/// Smallest step the controller will shrink to before accepting a step unconditionally.
const CK_MIN_STEP: f64 = 1e-10;

/// Embedded Runge-Kutta 5(4) with step size control from the solver tolerances.
#[derive(Debug, Clone, Copy, Default)]
pub struct CashKarp54;

impl OdeSolver for CashKarp54 {
    fn name(&self) -> &'static str {
        "Cash-Karp 5(4)"
    }

    fn workspace_size(&self, n: usize) -> usize {
        8 * n
    }

    fn uses_error_control(&self) -> bool {
        true
    }

    fn solve(
        &self,
        h: f64,
        x0: &mut [f64],
        workspace: &mut [f64],
        system: &mut dyn OdeSystem,
        tolerances: Tolerances,
    ) {
        let n = x0.len();
        let (k, rest) = workspace.split_at_mut(6 * n);
        let (trial, rest) = rest.split_at_mut(n);
        let error = &mut rest[..n];

        let mut t = 0.0;
        let mut h = h;
        loop {
            let (step, last) = clamp_step(t, h);

            system.evaluate(x0, &mut k[..n]);
            let rows: [&[f64]; 5] = [&CK_A2, &CK_A3, &CK_A4, &CK_A5, &CK_A6];
            for (stage, coefficients) in rows.iter().enumerate() {
                let (done, todo) = k.split_at_mut((stage + 1) * n);
                for i in 0..n {
                    let sum: f64 = coefficients
                        .iter()
                        .enumerate()
                        .map(|(j, a)| a * done[j * n + i])
                        .sum();
                    trial[i] = x0[i] + step * sum;
                }
                system.evaluate(trial, &mut todo[..n]);
            }

            let mut max_error: f64 = 0.0;
            for i in 0..n {
                let mut high = 0.0;
                let mut low = 0.0;
                for s in 0..6 {
                    high += CK_B5[s] * k[s * n + i];
                    low += CK_B4[s] * k[s * n + i];
                }
                trial[i] = x0[i] + step * high;
                error[i] = step * (high - low);
                let scale = tolerances.abs_err
                    + tolerances.rel_err * (x0[i].abs() + step * k[i].abs());
                max_error = max_error.max(error[i].abs() / scale);
            }

            if max_error > 1.0 && step > CK_MIN_STEP {
                h = (step * (0.9 * max_error.powf(-1.0 / 3.0)).max(0.2)).max(CK_MIN_STEP);
                continue;
            }

            x0.copy_from_slice(trial);
            if last {
                break;
            }
            t += step;
            if max_error < 0.5 {
                let grow = 0.9 * max_error.max(5f64.powi(-5)).powf(-1.0 / 5.0);
                h = step * grow;
            } else {
                h = step;
            }
        }
    }
}

/// Linearly implicit Euler: solves (I - hJ) dx = h f(x) each step. Suited to stiff
/// batches. Falls back to an explicit step if the matrix is singular.
#[derive(Debug, Clone, Copy, Default)]
pub struct RosenbrockEuler;

impl OdeSolver for RosenbrockEuler {
    fn name(&self) -> &'static str {
        "Rosenbrock-Euler"
    }

    fn workspace_size(&self, n: usize) -> usize {
        n
    }

    fn uses_jacobian(&self) -> bool {
        true
    }

    fn solve(
        &self,
        h: f64,
        x0: &mut [f64],
        workspace: &mut [f64],
        system: &mut dyn OdeSystem,
        _tolerances: Tolerances,
    ) {
        let n = x0.len();
        let dxdt = &mut workspace[..n];
        let mut jacobian = DMatrix::<f64>::zeros(n, n);
        let mut t = 0.0;
        loop {
            let (step, done) = clamp_step(t, h);
            system.evaluate(x0, dxdt);
            jacobian.fill(0.0);
            system.jacobian(x0, &mut jacobian);

            let matrix = DMatrix::<f64>::identity(n, n) - &jacobian * step;
            let rhs = DVector::from_column_slice(dxdt) * step;
            match matrix.lu().solve(&rhs) {
                Some(delta) => {
                    for (x, d) in x0.iter_mut().zip(delta.iter()) {
                        *x += d;
                    }
                }
                None => {
                    for (x, d) in x0.iter_mut().zip(rhs.iter()) {
                        *x += d;
                    }
                }
            }
            if done {
                break;
            }
            t += step;
        }
    }
}
