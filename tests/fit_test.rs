//! Integration tests for the linear fit and the calibration push

use laser_power_cal::hardware::capabilities::BeamControl;
use laser_power_cal::hardware::mock::{BeamEvent, MockBeamController};
use laser_power_cal::procedures::{
    fit, fit_points, fitted_min_max, push_calibration, SweepConfiguration, SweepResult,
};
use laser_power_cal::SweepError;

/// Result with the given rows, as if recorded by a sweep.
fn result_with(rows: Vec<Vec<f64>>, predicted: Vec<f64>) -> SweepResult {
    let config = SweepConfiguration {
        num_steps: rows.len(),
        sample_reps: rows.first().map_or(1, Vec::len),
        ..Default::default()
    };
    let mut result = SweepResult::new(&config, 920.0);
    result.mean_observed_power_mw = rows
        .iter()
        .map(|row| row.iter().sum::<f64>() / row.len() as f64)
        .collect();
    result.observed_power_mw = rows;
    result.predicted_power_mw = predicted;
    result
}

#[test]
fn test_exact_recovery_of_known_line() {
    let predicted: Vec<f64> = (0..6).map(|i| i as f64 * 20.0).collect();
    let rows = predicted
        .iter()
        .map(|p| vec![2.0 * p + 5.0, 2.0 * p + 5.0])
        .collect();
    let result = result_with(rows, predicted);

    let line = fit(&result).unwrap();
    assert!((line.slope - 2.0).abs() < 1e-9);
    assert!((line.intercept - 5.0).abs() < 1e-9);

    let (min_mw, max_mw) = fitted_min_max(&line, &result).unwrap();
    assert!((min_mw - 5.0).abs() < 1e-9);
    assert!((max_mw - 205.0).abs() < 1e-9);
}

#[test]
fn test_fit_uses_raw_points_not_means() {
    // Same line as fitting the flattened (predicted, observed) pairs.
    let predicted = vec![0.0, 50.0, 100.0];
    let rows = vec![vec![1.0, 3.0], vec![104.0, 100.0], vec![203.0, 201.0]];
    let line = fit(&result_with(rows, predicted.clone())).unwrap();

    let x: Vec<f64> = predicted.iter().flat_map(|&p| [p, p]).collect();
    let y = vec![1.0, 3.0, 104.0, 100.0, 203.0, 201.0];
    let (direct, quality) = fit_points(&x, &y).unwrap();

    assert!((line.slope - direct.slope).abs() < 1e-12);
    assert!((line.intercept - direct.intercept).abs() < 1e-12);
    assert_eq!(quality.n_points, 6);
}

#[test]
fn test_fit_is_invariant_to_step_order() {
    let predicted = vec![0.0, 25.0, 50.0, 75.0, 100.0];
    let rows = vec![
        vec![2.1, 1.8],
        vec![28.4, 28.9],
        vec![54.0, 55.1],
        vec![80.2, 81.0],
        vec![106.9, 107.3],
    ];
    let forward = fit(&result_with(rows.clone(), predicted.clone())).unwrap();

    let order = [3, 0, 4, 2, 1];
    let shuffled_rows = order.iter().map(|&i| rows[i].clone()).collect();
    let shuffled_predicted = order.iter().map(|&i| predicted[i]).collect();
    let shuffled = fit(&result_with(shuffled_rows, shuffled_predicted)).unwrap();

    assert!((forward.slope - shuffled.slope).abs() < 1e-9);
    assert!((forward.intercept - shuffled.intercept).abs() < 1e-9);
}

#[test]
fn test_fit_is_invariant_to_reading_order_within_a_step() {
    let predicted = vec![0.0, 25.0, 50.0, 75.0];
    let rows = vec![
        vec![2.1, 1.8, 2.4],
        vec![28.4, 28.9, 27.7],
        vec![54.0, 55.1, 54.6],
        vec![80.2, 81.0, 79.9],
    ];
    let forward = fit(&result_with(rows.clone(), predicted.clone())).unwrap();

    let permuted = rows
        .iter()
        .enumerate()
        .map(|(i, row)| {
            let mut row = row.clone();
            let len = row.len();
            row.rotate_left(i % len);
            row.reverse();
            row
        })
        .collect();
    let shuffled = fit(&result_with(permuted, predicted)).unwrap();

    assert!((forward.slope - shuffled.slope).abs() < 1e-9);
    assert!((forward.intercept - shuffled.intercept).abs() < 1e-9);
}

#[test]
fn test_identical_predictions_are_degenerate() {
    let result = result_with(vec![vec![10.0], vec![12.0], vec![11.0]], vec![40.0; 3]);
    assert!(matches!(fit(&result), Err(SweepError::DegenerateFit(_))));
}

#[test]
fn test_empty_result_is_degenerate() {
    let result = result_with(Vec::new(), Vec::new());
    assert!(matches!(fit(&result), Err(SweepError::DegenerateFit(_))));
}

#[tokio::test]
async fn test_push_calibration_rounds_to_whole_milliwatts() {
    let beam = MockBeamController::new(2, 0.3);

    let (min_w, max_w) = push_calibration(&beam, (1.6, 250.4), 1).await.unwrap();
    assert_eq!(min_w, 0.002);
    assert_eq!(max_w, 0.25);
    assert_eq!(beam.power_limits(1).await, Some((0.002, 0.25)));
    assert_eq!(beam.power_limits(0).await, Some((0.0, 0.3)));

    let events = beam.events().await;
    assert_eq!(
        events,
        vec![BeamEvent::SetLimits {
            min_watts: 0.002,
            max_watts: 0.25,
            beam: 1
        }]
    );
}

#[tokio::test]
async fn test_push_calibration_rejects_bad_bounds() {
    let beam = MockBeamController::new(1, 0.3);

    assert!(matches!(
        push_calibration(&beam, (f64::NAN, 100.0), 0).await,
        Err(SweepError::InvalidCalibration(_))
    ));
    // Collapses to the same mW after rounding.
    assert!(matches!(
        push_calibration(&beam, (100.2, 99.9), 0).await,
        Err(SweepError::InvalidCalibration(_))
    ));
    assert!(matches!(
        push_calibration(&beam, (1.0, 100.0), 3).await,
        Err(SweepError::InvalidConfig(_))
    ));
    assert!(beam.events().await.is_empty());
}

#[tokio::test]
async fn test_pushed_limits_change_predictions() {
    let beam = MockBeamController::new(1, 0.3);
    push_calibration(&beam, (2.0, 315.0), 0).await.unwrap();

    let watts = beam.power_fraction_to_watts(1.0, 0).await.unwrap();
    assert!((watts - 0.315).abs() < 1e-12);
}
