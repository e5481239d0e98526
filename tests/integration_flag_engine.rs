//! Integration tests for the quality flag engine
//!
//! These tests compose flags over a realistic deployment with seeded
//! defects and verify that every fired check stays individually
//! recoverable from the composite value, that the statistical layer is
//! added rather than merged, and that threshold resolution walks the
//! deployment override before the configured default.

use adcp_processor::Result;
use adcp_processor::error::AdcpError;
use adcp_processor::models::{DeploymentContext, Orientation, VarData};
use adcp_processor::qc::statistical::{Bound, StatisticalChecks};
use adcp_processor::qc::{
    CheckId, FlagEngine, InstrumentChecks, VelocityErrorCheck, variable_flags, STATISTICAL_BIT,
};
use adcp_processor::reader::RawDeployment;
use ndarray::{Array1, Array2, Array3};

/// Create a realistic upward-looking deployment in a deep lake basin:
/// 300 kHz instrument moored at 100 m over a 136 m bottom.
fn create_basin_context() -> DeploymentContext {
    DeploymentContext {
        orientation: Orientation::Up,
        cabled: true,
        transducer_depth: 100.0,
        bottom_depth: 136.0,
        beam_angle_deg: 20.0,
        beam_freq_khz: 300.0,
        xmit_length: 1.2,
        noise_floor: 38.0,
        window: None,
    }
}

/// Generate a clean deployment of 16 bins and 6 ensembles at 10-minute
/// spacing. The two shallowest bins sit inside the sidelobe contamination
/// range of the basin geometry; everything else passes every check.
fn generate_clean_deployment() -> RawDeployment {
    let n_depth = 16;
    let n_time = 6;
    let mut prcnt_gd = Array3::zeros((4, n_depth, n_time));
    prcnt_gd.index_axis_mut(ndarray::Axis(0), 0).fill(5.0);
    prcnt_gd.index_axis_mut(ndarray::Axis(0), 2).fill(3.0);
    prcnt_gd.index_axis_mut(ndarray::Axis(0), 3).fill(90.0);

    RawDeployment {
        time: Array1::from_iter((0..n_time).map(|i| 1_614_556_800.0 + i as f64 * 600.0)),
        depth: Array1::from_iter((0..n_depth).map(|i| 80.0 - 5.0 * i as f64)),
        u: Array2::from_elem((n_depth, n_time), 0.12),
        v: Array2::from_elem((n_depth, n_time), -0.04),
        w: Array2::from_elem((n_depth, n_time), 0.002),
        error_velocity: Array2::from_elem((n_depth, n_time), 0.01),
        corr: Array3::from_elem((4, n_depth, n_time), 0.85),
        prcnt_gd,
        echo: Array3::from_elem((4, n_depth, n_time), 80.0),
        heading: Array1::from_elem(n_time, 143.0),
        roll: Array1::from_elem(n_time, 0.8),
        pitch: Array1::from_elem(n_time, -0.5),
        temperature: Array1::from_elem(n_time, 5.6),
        battery: Array1::from_elem(n_time, 31.0),
        beam_angle_deg: 20.0,
        beam_freq_khz: 300.0,
        xmit_length: 1.2,
    }
}

/// Decompose a composite flag value into the set of checks that fired
fn fired_checks(value: u16) -> Vec<CheckId> {
    CheckId::ALL
        .iter()
        .copied()
        .filter(|c| value & c.bit() != 0)
        .collect()
}

#[test]
fn test_sidelobe_region_is_flagged_monotonically() -> Result<()> {
    let checks = InstrumentChecks::standard();
    let overrides = InstrumentChecks::default();
    let engine = FlagEngine::new(&checks, &overrides);

    let raw = generate_clean_deployment();
    let composite = engine.instrument_composite(&raw, &create_basin_context())?;

    // Critical range for this geometry is ~6.0 m; the first bin inside it
    // is bin 15 (5 m), and the conservative margin pulls bin 14 in too.
    for j in 0..raw.n_time() {
        for i in 0..14 {
            assert_eq!(
                composite[[i, j]] & CheckId::Interface.bit(),
                0,
                "bin {i} should be outside the sidelobe region"
            );
        }
        assert_ne!(composite[[14, j]] & CheckId::Interface.bit(), 0);
        assert_ne!(composite[[15, j]] & CheckId::Interface.bit(), 0);

        // Once flagged, every shallower bin stays flagged
        let mut contaminated = false;
        for i in 0..raw.n_depth() {
            let here = composite[[i, j]] & CheckId::Interface.bit() != 0;
            assert!(
                here || !contaminated,
                "interface flag must be monotonic along the profile"
            );
            contaminated |= here;
        }
    }
    Ok(())
}

#[test]
fn test_seeded_defects_raise_exactly_their_bits() -> Result<()> {
    let checks = InstrumentChecks::standard();
    let overrides = InstrumentChecks::default();
    let engine = FlagEngine::new(&checks, &overrides);

    let mut raw = generate_clean_deployment();
    // One weak beam, one tilted ensemble, one error-velocity burst, one
    // echo step from a passing mooring line.
    raw.corr[[1, 3, 1]] = 0.15;
    raw.roll[2] = 25.0;
    raw.error_velocity[[4, 3]] = 0.5;
    raw.echo[[2, 6, 0]] = 150.0;

    let composite = engine.instrument_composite(&raw, &create_basin_context())?;

    // A weak beam trips both the floor and the beam-agreement check
    assert_eq!(
        fired_checks(composite[[3, 1]]),
        vec![CheckId::Correlation, CheckId::CorrelationStd]
    );
    // Tilt covers the whole profile at that ensemble
    assert_eq!(fired_checks(composite[[0, 2]]), vec![CheckId::Tilt]);
    assert_eq!(
        fired_checks(composite[[14, 2]]),
        vec![CheckId::Interface, CheckId::Tilt]
    );
    assert_eq!(fired_checks(composite[[4, 3]]), vec![CheckId::VelocityError]);
    assert_eq!(fired_checks(composite[[6, 0]]), vec![CheckId::EchoStep]);
    // Clean samples stay clean
    assert!(fired_checks(composite[[0, 0]]).is_empty());
    assert_eq!(fired_checks(composite[[15, 5]]), vec![CheckId::Interface]);
    Ok(())
}

#[test]
fn test_statistical_layer_composes_additively() -> Result<()> {
    let checks = InstrumentChecks::standard();
    let overrides = InstrumentChecks::default();
    let engine = FlagEngine::new(&checks, &overrides);

    let mut raw = generate_clean_deployment();
    raw.corr[[1, 3, 1]] = 0.15;
    let composite = engine.instrument_composite(&raw, &create_basin_context())?;

    let mut u = raw.u.clone();
    u[[2, 4]] = 9.9;
    let stat_checks = StatisticalChecks {
        bounds: Some([Bound::Number(-3.0), Bound::Number(3.0)]),
        ..Default::default()
    };
    let flags = variable_flags(
        &VarData::Profile(u),
        raw.time.view(),
        &stat_checks,
        Some(&composite),
        0.0,
    );
    let flags = match flags {
        adcp_processor::qc::FlagData::Profile(f) => f,
        _ => unreachable!(),
    };

    // The statistical layer only ever adds 0 or 1 on top of the composite
    for ((i, j), &f) in flags.indexed_iter() {
        let stat = f - composite[[i, j]];
        assert!(stat == 0 || stat == STATISTICAL_BIT);
    }
    assert_eq!(flags[[2, 4]], composite[[2, 4]] + STATISTICAL_BIT);
    assert_eq!(
        flags[[3, 1]],
        CheckId::Correlation.bit() + CheckId::CorrelationStd.bit()
    );
    Ok(())
}

#[test]
fn test_deployment_override_replaces_library_default() -> Result<()> {
    let checks = InstrumentChecks::standard();
    let overrides = InstrumentChecks {
        velerror: Some(VelocityErrorCheck {
            vel_threshold: Some(1.0),
        }),
        ..Default::default()
    };
    let engine = FlagEngine::new(&checks, &overrides);

    let mut raw = generate_clean_deployment();
    raw.error_velocity[[4, 3]] = 0.5;

    // 0.5 m/s exceeds the 0.05 default but not the deployment's 1.0
    let composite = engine.instrument_composite(&raw, &create_basin_context())?;
    assert_eq!(composite[[4, 3]] & CheckId::VelocityError.bit(), 0);
    Ok(())
}

#[test]
fn test_missing_threshold_is_a_configuration_error() {
    let checks = InstrumentChecks {
        velerror: Some(VelocityErrorCheck {
            vel_threshold: None,
        }),
        ..Default::default()
    };
    let overrides = InstrumentChecks::default();
    let engine = FlagEngine::new(&checks, &overrides);

    let err = engine
        .instrument_composite(&generate_clean_deployment(), &create_basin_context())
        .unwrap_err();
    assert!(matches!(err, AdcpError::MissingThreshold { ref check } if check == "velerror"));
}

#[test]
fn test_all_missing_input_is_all_clear() -> Result<()> {
    // Interface is geometry-driven, so disable it to isolate the
    // data-driven checks against an all-NaN deployment.
    let checks = InstrumentChecks {
        interface: None,
        ..InstrumentChecks::standard()
    };
    let overrides = InstrumentChecks::default();
    let engine = FlagEngine::new(&checks, &overrides);

    let mut raw = generate_clean_deployment();
    raw.corr.fill(f64::NAN);
    raw.prcnt_gd.fill(f64::NAN);
    raw.error_velocity.fill(f64::NAN);
    raw.echo.fill(f64::NAN);
    raw.roll.fill(f64::NAN);
    raw.pitch.fill(f64::NAN);

    let composite = engine.instrument_composite(&raw, &create_basin_context())?;
    assert!(composite.iter().all(|&v| v == 0));
    Ok(())
}
