use nalgebra::*;
use gausshmm::*;
use gausshmm::prob::is_pd;
use approx::{assert_relative_eq, assert_abs_diff_eq};
use rand::{Rng, SeedableRng};
use rand::rngs::StdRng;

/// Scaled forward-backward recursion, standing for the external E-step.
/// Returns (gamma, epsilon, log-likelihood of the sequence).
fn forward_backward(hmm : &GaussianHmm, q : &DMatrix<f64>) -> (DMatrix<f64>, Vec<DMatrix<f64>>, f64) {
    let b = hmm.likelihood(q).unwrap();
    let (t_n, n) = b.shape();
    let a = hmm.transition_prob();
    let pi = hmm.initial_prob();

    let mut alpha = DMatrix::zeros(t_n, n);
    let mut scale = DVector::zeros(t_n);
    for t in 0..t_n {
        for j in 0..n {
            let prior = if t == 0 {
                pi[j]
            } else {
                (0..n).map(|i| alpha[(t - 1, i)] * a[(i, j)] ).sum::<f64>()
            };
            alpha[(t, j)] = prior * b[(t, j)];
        }
        scale[t] = alpha.row(t).sum();
        alpha.row_mut(t).unscale_mut(scale[t]);
    }

    let mut beta = DMatrix::from_element(t_n, n, 1.);
    for t in (0..t_n - 1).rev() {
        for i in 0..n {
            beta[(t, i)] = (0..n)
                .map(|j| a[(i, j)] * b[(t + 1, j)] * beta[(t + 1, j)] )
                .sum::<f64>() / scale[t + 1];
        }
    }

    let gamma = alpha.component_mul(&beta);
    let epsilon = (0..t_n - 1)
        .map(|t| DMatrix::from_fn(n, n, |i, j| {
            alpha[(t, i)] * a[(i, j)] * b[(t + 1, j)] * beta[(t + 1, j)] / scale[t + 1]
        }))
        .collect();
    let loglik = scale.iter().map(|c| c.ln() ).sum();
    (gamma, epsilon, loglik)
}

/// Draws a sequence of length n from a chain with the informed transition
/// matrix and per-state gaussians.
fn simulate(rng : &mut StdRng, transition : &DMatrix<f64>, states : &[MultiNormal], n : usize) -> DMatrix<f64> {
    let p = states[0].dim();
    let mut q = DMatrix::zeros(n, p);
    let mut s = rng.gen_range(0..states.len());
    for t in 0..n {
        q.row_mut(t).copy_from(&states[s].sample(rng, 1));
        let u : f64 = rng.gen();
        let mut acc = 0.;
        for j in 0..states.len() {
            acc += transition[(s, j)];
            if u < acc || j == states.len() - 1 {
                s = j;
                break;
            }
        }
    }
    q
}

#[test]
fn univariate_density_integrates_to_one() {
    let mu = DVector::from_element(1, 0.7);
    let sigma = DMatrix::from_element(1, 1, 2.3);
    let mn = MultiNormal::new(mu, sigma).unwrap();
    let sd = 2.3f64.sqrt();
    let (lo, hi, n) = (0.7 - 12. * sd, 0.7 + 12. * sd, 4000);
    let h = (hi - lo) / n as f64;
    let mut integral = 0.;
    for k in 0..=n {
        let x = DVector::from_element(1, lo + k as f64 * h);
        let p = mn.prob(&x).unwrap();
        assert!(p >= 0.);
        let w = if k == 0 || k == n { 0.5 } else { 1. };
        integral += w * p * h;
    }
    assert_abs_diff_eq!(integral, 1., epsilon = 1E-6);
}

#[test]
fn bivariate_density_integrates_to_one() {
    let mu = DVector::from_vec(vec![0.5, -0.5]);
    let sigma = DMatrix::from_row_slice(2, 2, &[1., 0.4, 0.4, 0.5]);
    let mn = MultiNormal::new(mu, sigma).unwrap();
    let h = 0.05;
    let mut integral = 0.;
    for a in 0..=320 {
        for b in 0..=320 {
            let x = DVector::from_vec(vec![-8. + a as f64 * h, -8. + b as f64 * h]);
            let p = mn.prob(&x).unwrap();
            assert!(p >= 0.);
            integral += p * h * h;
        }
    }
    assert_abs_diff_eq!(integral, 1., epsilon = 1E-4);
}

#[test]
fn singular_initial_covariance_is_invalid() {
    let err = GaussianHmm::new(
        DVector::from_vec(vec![0.5, 0.5]),
        DMatrix::from_element(2, 2, 0.5),
        DMatrix::zeros(2, 2),
        vec![DMatrix::identity(2, 2), DMatrix::zeros(2, 2)]
    ).unwrap_err();
    assert!(matches!(err, HmmError::InvalidParameters { .. }));
    assert_eq!(err.location().state, Some(1));
}

#[test]
fn likelihood_is_a_row_map() {
    let hmm = GaussianHmm::new(
        DVector::from_vec(vec![0.2, 0.3, 0.5]),
        DMatrix::from_element(3, 3, 1. / 3.),
        DMatrix::from_row_slice(3, 2, &[0., 0., 1., 2., -2., 1.]),
        vec![DMatrix::identity(2, 2), DMatrix::from_row_slice(2, 2, &[1., 0.5, 0.5, 1.]), DMatrix::identity(2, 2) * 3.]
    ).unwrap();
    let mut rng = StdRng::seed_from_u64(3);
    let q = DMatrix::from_fn(5, 2, |_, _| rng.gen_range(-3.0..3.0) );
    let b = hmm.likelihood(&q).unwrap();
    assert_eq!(b.shape(), (5, 3));

    let perm = [3, 0, 4, 1, 2];
    let permuted = DMatrix::from_fn(5, 2, |r, c| q[(perm[r], c)] );
    let bp = hmm.likelihood(&permuted).unwrap();
    for (r, &src) in perm.iter().enumerate() {
        assert_eq!(bp.row(r), b.row(src));
    }

    let half = hmm.likelihood(&q.rows(0, 2).clone_owned()).unwrap();
    assert_eq!(half, b.rows(0, 2).clone_owned());
}

#[test]
fn likelihood_is_shared_between_readers() {
    let hmm = GaussianHmm::new(
        DVector::from_vec(vec![0.5, 0.5]),
        DMatrix::from_element(2, 2, 0.5),
        DMatrix::from_row_slice(2, 1, &[0., 3.]),
        vec![DMatrix::identity(1, 1); 2]
    ).unwrap();
    let q = DMatrix::from_fn(50, 1, |i, _| i as f64 * 0.1 );
    let expected = hmm.likelihood(&q).unwrap();
    std::thread::scope(|s| {
        let handles : Vec<_> = (0..4).map(|_| s.spawn(|| hmm.likelihood(&q).unwrap() )).collect();
        for h in handles {
            assert_eq!(h.join().unwrap(), expected);
        }
    });
}

#[test]
fn uniform_posteriors_give_valid_parameters() {
    let n = 3;
    let mut hmm = GaussianHmm::new(
        DVector::from_vec(vec![0.6, 0.2, 0.2]),
        DMatrix::from_row_slice(3, 3, &[0.8, 0.1, 0.1, 0.1, 0.8, 0.1, 0.1, 0.1, 0.8]),
        DMatrix::from_row_slice(3, 2, &[0., 0., 1., 1., 2., 2.]),
        vec![DMatrix::identity(2, 2); 3]
    ).unwrap();
    let mut rng = StdRng::seed_from_u64(7);
    let qs : Vec<DMatrix<f64>> = [5, 7].iter()
        .map(|&t| DMatrix::from_fn(t, 2, |_, _| rng.gen_range(-1.0..1.0) ))
        .collect();
    let gammas : Vec<_> = qs.iter()
        .map(|q| DMatrix::from_element(q.nrows(), n, 1. / n as f64) )
        .collect();
    let epsilons : Vec<_> = qs.iter()
        .map(|q| vec![DMatrix::from_element(n, n, 1. / (n * n) as f64); q.nrows() - 1] )
        .collect();
    hmm.maximize(&qs, &gammas, &epsilons).unwrap();

    assert_relative_eq!(hmm.initial_prob().sum(), 1., epsilon = 1E-12);
    for row in hmm.transition_prob().row_iter() {
        assert_relative_eq!(row.sum(), 1., epsilon = 1E-12);
    }
    for i in 0..n {
        assert!(is_pd(hmm.cov(i)));
        assert_relative_eq!(*hmm.mean(i), *hmm.mean(0), epsilon = 1E-12);
    }
}

#[test]
fn updated_parameters_reach_likelihood() {
    let mut hmm = GaussianHmm::new(
        DVector::from_vec(vec![0.5, 0.5]),
        DMatrix::from_element(2, 2, 0.5),
        DMatrix::from_row_slice(2, 1, &[0., 4.]),
        vec![DMatrix::identity(1, 1); 2]
    ).unwrap();
    let q = DMatrix::from_row_slice(4, 1, &[0., 1., 5., 6.]);
    let gamma = DMatrix::from_row_slice(4, 2, &[0.99, 0.01, 0.99, 0.01, 0.01, 0.99, 0.01, 0.99]);
    let epsilon : Vec<_> = (0..3).map(|t| gamma.row(t).transpose() * gamma.row(t + 1) ).collect();
    let before = hmm.likelihood(&q).unwrap();
    hmm.maximize(&[q.clone()], &[gamma], &[epsilon]).unwrap();
    let after = hmm.likelihood(&q).unwrap();
    assert!(after != before);
    for t in 0..4 {
        let x = q.row(t).transpose();
        for i in 0..2 {
            let expected = density(hmm.mean(i), hmm.cov(i), &x).unwrap();
            assert_relative_eq!(after[(t, i)], expected, epsilon = 1E-14);
        }
    }
}

#[test]
fn baum_welch_recovers_generating_parameters() {
    let mut rng = StdRng::seed_from_u64(42);
    let truth = vec![
        MultiNormal::new(DVector::from_vec(vec![0., 0.]), DMatrix::from_row_slice(2, 2, &[1., 0.3, 0.3, 1.])).unwrap(),
        MultiNormal::new(DVector::from_vec(vec![5., 5.]), DMatrix::from_row_slice(2, 2, &[0.5, 0., 0., 2.])).unwrap()
    ];
    let transition = DMatrix::from_row_slice(2, 2, &[0.9, 0.1, 0.2, 0.8]);
    let qs : Vec<_> = (0..3).map(|_| simulate(&mut rng, &transition, &truth, 200) ).collect();

    let mut hmm = GaussianHmm::new(
        DVector::from_vec(vec![0.5, 0.5]),
        DMatrix::from_element(2, 2, 0.5),
        DMatrix::from_row_slice(2, 2, &[1., 1., 4., 4.]),
        vec![DMatrix::identity(2, 2) * 2.; 2]
    ).unwrap();

    let mut prev = f64::NEG_INFINITY;
    for _ in 0..40 {
        let mut gammas = Vec::new();
        let mut epsilons = Vec::new();
        let mut loglik = 0.;
        for q in &qs {
            let (gamma, epsilon, ll) = forward_backward(&hmm, q);
            gammas.push(gamma);
            epsilons.push(epsilon);
            loglik += ll;
        }
        assert!(loglik >= prev - 1E-6 * loglik.abs());
        prev = loglik;
        hmm.maximize(&qs, &gammas, &epsilons).unwrap();

        assert_relative_eq!(hmm.initial_prob().sum(), 1., epsilon = 1E-9);
        for row in hmm.transition_prob().row_iter() {
            assert_relative_eq!(row.sum(), 1., epsilon = 1E-9);
        }
        for i in 0..2 {
            assert!(is_pd(hmm.cov(i)));
        }
    }

    for i in 0..2 {
        assert_abs_diff_eq!(*hmm.mean(i), *truth[i].mean(), epsilon = 0.3);
        assert_abs_diff_eq!(*hmm.cov(i), *truth[i].cov(), epsilon = 0.6);
    }
    assert_abs_diff_eq!(*hmm.transition_prob(), transition, epsilon = 0.1);
}

#[test]
fn config_file_round_trip() {
    let path = std::env::temp_dir().join(format!("gausshmm-config-{}.json", std::process::id()));
    let config = EmConfig { min_covar : 1E-4, ..EmConfig::reference() };
    config.save_to_path(&path).unwrap();
    let back = EmConfig::load_from_path(&path).unwrap();
    std::fs::remove_file(&path).unwrap();
    assert_eq!(back, config);
    assert!(EmConfig::load_from_path(&path).is_err());
}
