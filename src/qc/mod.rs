//! Quality flag engine
//!
//! Combines the instrument-specific checks (bit flags 2^1..2^8) and the
//! generic statistical suite (flag value exactly 1) into one integer flag
//! per sample. The two layers are summed, never overwritten, so every
//! contributing check stays recoverable from the composed value.

pub mod instrument;
pub mod statistical;

use crate::constants::default_thresholds;
use crate::error::{AdcpError, Result};
use crate::models::{DeploymentContext, Orientation, VarData};
use crate::reader::RawDeployment;
use ndarray::{Array1, Array2, ArrayView1, Axis};
use serde::{Deserialize, Serialize};
use statistical::StatisticalChecks;
use tracing::debug;

/// Bit contributed by the generic statistical suite
pub const STATISTICAL_BIT: u16 = 1;

// =============================================================================
// Check identifiers and bit registry
// =============================================================================

/// Instrument-specific check identifiers, in execution order.
///
/// Composition is commutative (each check owns one bit), so the order only
/// fixes the log sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CheckId {
    Interface,
    Correlation,
    PercentGood14,
    PercentGood3,
    VelocityError,
    Tilt,
    CorrelationStd,
    EchoStep,
}

impl CheckId {
    pub const ALL: [CheckId; 8] = [
        CheckId::Interface,
        CheckId::Correlation,
        CheckId::PercentGood14,
        CheckId::PercentGood3,
        CheckId::VelocityError,
        CheckId::Tilt,
        CheckId::CorrelationStd,
        CheckId::EchoStep,
    ];

    /// Power-of-two bit owned by this check
    pub fn bit(self) -> u16 {
        match self {
            CheckId::Interface => 1 << 1,
            CheckId::Correlation => 1 << 2,
            CheckId::PercentGood14 => 1 << 3,
            CheckId::PercentGood3 => 1 << 4,
            CheckId::VelocityError => 1 << 5,
            CheckId::Tilt => 1 << 6,
            CheckId::CorrelationStd => 1 << 7,
            CheckId::EchoStep => 1 << 8,
        }
    }

    /// Configuration key of this check
    pub fn key(self) -> &'static str {
        match self {
            CheckId::Interface => "interface",
            CheckId::Correlation => "corr",
            CheckId::PercentGood14 => "PG14",
            CheckId::PercentGood3 => "PG3",
            CheckId::VelocityError => "velerror",
            CheckId::Tilt => "tilt",
            CheckId::CorrelationStd => "corrstd",
            CheckId::EchoStep => "echodiff",
        }
    }
}

/// Mask of every bit an instrument composite may carry
pub fn instrument_bit_mask() -> u16 {
    CheckId::ALL.iter().fold(0, |acc, c| acc | c.bit())
}

/// Validate the bit registry: every check owns a distinct power of two and
/// none collides with the statistical bit. Run once at pipeline startup.
pub fn validate_bit_registry() -> Result<()> {
    let mut seen: u16 = STATISTICAL_BIT;
    for check in CheckId::ALL {
        let bit = check.bit();
        if !bit.is_power_of_two() {
            return Err(AdcpError::FlagRegistry {
                reason: format!("check '{}' bit {} is not a power of two", check.key(), bit),
            });
        }
        if seen & bit != 0 {
            return Err(AdcpError::FlagRegistry {
                reason: format!("check '{}' bit {} already assigned", check.key(), bit),
            });
        }
        seen |= bit;
    }
    Ok(())
}

// =============================================================================
// Check parameters
// =============================================================================

/// Threshold parameters are optional at every layer; resolution walks the
/// deployment override first, then the configured default, and a hole in
/// both is a configuration error for that file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterfaceCheck {}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrelationCheck {
    pub corr_threshold: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PercentGoodCheck {
    pub percentage_threshold: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VelocityErrorCheck {
    pub vel_threshold: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TiltCheck {
    pub tilt_threshold: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrelationStdCheck {
    pub std_threshold: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EchoStepCheck {
    pub diff_threshold: Option<f64>,
}

/// Enabled instrument checks with their default thresholds.
///
/// A check is enabled when its entry is present; the same structure doubles
/// as the per-deployment override table (all entries absent by default).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstrumentChecks {
    pub interface: Option<InterfaceCheck>,
    pub corr: Option<CorrelationCheck>,
    #[serde(rename = "PG14")]
    pub pg14: Option<PercentGoodCheck>,
    #[serde(rename = "PG3")]
    pub pg3: Option<PercentGoodCheck>,
    pub velerror: Option<VelocityErrorCheck>,
    pub tilt: Option<TiltCheck>,
    pub corrstd: Option<CorrelationStdCheck>,
    pub echodiff: Option<EchoStepCheck>,
}

impl InstrumentChecks {
    /// Full check set with the canonical thresholds
    pub fn standard() -> Self {
        Self {
            interface: Some(InterfaceCheck {}),
            corr: Some(CorrelationCheck {
                corr_threshold: Some(default_thresholds::CORRELATION_FLOOR),
            }),
            pg14: Some(PercentGoodCheck {
                percentage_threshold: Some(default_thresholds::PERCENT_GOOD_14),
            }),
            pg3: Some(PercentGoodCheck {
                percentage_threshold: Some(default_thresholds::PERCENT_GOOD_3),
            }),
            velerror: Some(VelocityErrorCheck {
                vel_threshold: Some(default_thresholds::VELOCITY_ERROR),
            }),
            tilt: Some(TiltCheck {
                tilt_threshold: Some(default_thresholds::TILT),
            }),
            corrstd: Some(CorrelationStdCheck {
                std_threshold: Some(default_thresholds::CORRELATION_STD),
            }),
            echodiff: Some(EchoStepCheck {
                diff_threshold: Some(default_thresholds::ECHO_STEP),
            }),
        }
    }
}

// =============================================================================
// Flag arrays
// =============================================================================

/// Integer flag array shaped like its target variable
#[derive(Debug, Clone, PartialEq)]
pub enum FlagData {
    Series(Array1<u16>),
    Profile(Array2<u16>),
}

impl FlagData {
    /// Convert to the f64 payload persisted in output files
    pub fn to_var_data(&self) -> VarData {
        match self {
            FlagData::Series(a) => VarData::Series(a.mapv(f64::from)),
            FlagData::Profile(a) => VarData::Profile(a.mapv(f64::from)),
        }
    }
}

// =============================================================================
// Engine
// =============================================================================

/// Composes per-variable flags for one deployment file
pub struct FlagEngine<'a> {
    /// Enabled checks with configured defaults
    pub checks: &'a InstrumentChecks,
    /// Per-deployment threshold overrides
    pub overrides: &'a InstrumentChecks,
}

impl<'a> FlagEngine<'a> {
    pub fn new(checks: &'a InstrumentChecks, overrides: &'a InstrumentChecks) -> Self {
        Self { checks, overrides }
    }

    fn threshold(check: CheckId, over: Option<f64>, default: Option<f64>) -> Result<f64> {
        over.or(default).ok_or(AdcpError::MissingThreshold {
            check: check.key().to_string(),
        })
    }

    /// Run every enabled instrument check and accumulate their bits into one
    /// `(depth, time)` composite.
    pub fn instrument_composite(
        &self,
        raw: &RawDeployment,
        ctx: &DeploymentContext,
    ) -> Result<Array2<u16>> {
        let shape = (raw.n_depth(), raw.n_time());
        let mut composite: Array2<u16> = Array2::zeros(shape);

        for check in CheckId::ALL {
            let mask = match check {
                CheckId::Interface => {
                    if self.checks.interface.is_none() {
                        continue;
                    }
                    match ctx.orientation {
                        Orientation::Up => instrument::interface_top(
                            raw.depth.view(),
                            raw.n_time(),
                            ctx.transducer_depth,
                            ctx.beam_angle_deg,
                        ),
                        Orientation::Down => instrument::interface_bottom(
                            raw.depth.view(),
                            raw.n_time(),
                            ctx.transducer_depth,
                            ctx.bottom_depth,
                            ctx.beam_angle_deg,
                        ),
                    }
                }
                CheckId::Correlation => {
                    let Some(params) = &self.checks.corr else { continue };
                    let t = Self::threshold(
                        check,
                        self.overrides.corr.and_then(|p| p.corr_threshold),
                        params.corr_threshold,
                    )?;
                    instrument::correlation_floor(raw.corr.view(), t)
                }
                CheckId::PercentGood14 => {
                    let Some(params) = &self.checks.pg14 else { continue };
                    let t = Self::threshold(
                        check,
                        self.overrides.pg14.and_then(|p| p.percentage_threshold),
                        params.percentage_threshold,
                    )?;
                    instrument::percent_good_14(
                        raw.prcnt_gd.index_axis(Axis(0), 0),
                        raw.prcnt_gd.index_axis(Axis(0), 3),
                        t,
                    )
                }
                CheckId::PercentGood3 => {
                    let Some(params) = &self.checks.pg3 else { continue };
                    let t = Self::threshold(
                        check,
                        self.overrides.pg3.and_then(|p| p.percentage_threshold),
                        params.percentage_threshold,
                    )?;
                    instrument::percent_good_3(raw.prcnt_gd.index_axis(Axis(0), 2), t)
                }
                CheckId::VelocityError => {
                    let Some(params) = &self.checks.velerror else { continue };
                    let t = Self::threshold(
                        check,
                        self.overrides.velerror.and_then(|p| p.vel_threshold),
                        params.vel_threshold,
                    )?;
                    instrument::velocity_error(raw.error_velocity.view(), t)
                }
                CheckId::Tilt => {
                    let Some(params) = &self.checks.tilt else { continue };
                    let t = Self::threshold(
                        check,
                        self.overrides.tilt.and_then(|p| p.tilt_threshold),
                        params.tilt_threshold,
                    )?;
                    let columns = instrument::tilt(raw.roll.view(), raw.pitch.view(), t);
                    let mut mask = Array2::from_elem(shape, false);
                    for (j, &flagged) in columns.iter().enumerate() {
                        if flagged {
                            mask.column_mut(j).fill(true);
                        }
                    }
                    mask
                }
                CheckId::CorrelationStd => {
                    let Some(params) = &self.checks.corrstd else { continue };
                    let t = Self::threshold(
                        check,
                        self.overrides.corrstd.and_then(|p| p.std_threshold),
                        params.std_threshold,
                    )?;
                    instrument::correlation_spread(raw.corr.view(), t)
                }
                CheckId::EchoStep => {
                    let Some(params) = &self.checks.echodiff else { continue };
                    let t = Self::threshold(
                        check,
                        self.overrides.echodiff.and_then(|p| p.diff_threshold),
                        params.diff_threshold,
                    )?;
                    instrument::echo_step(raw.echo.view(), t)
                }
            };

            let bit = check.bit();
            let fired = mask.iter().filter(|&&f| f).count();
            if fired > 0 {
                debug!(check = check.key(), bit, fired, "instrument check fired");
            }
            ndarray::Zip::from(&mut composite).and(&mask).for_each(|c, &m| {
                if m {
                    *c |= bit;
                }
            });
        }

        Ok(composite)
    }
}

/// Compose the final flag for one variable: statistical 0/1 plus the
/// instrument composite where the shapes match (profile variables only).
pub fn variable_flags(
    data: &VarData,
    time: ArrayView1<f64>,
    checks: &StatisticalChecks,
    instrument_composite: Option<&Array2<u16>>,
    now: f64,
) -> FlagData {
    match data {
        VarData::Series(values) => {
            let stat = statistical::check_series(values.view(), time, checks, now);
            FlagData::Series(stat.mapv(|f| if f { STATISTICAL_BIT } else { 0 }))
        }
        VarData::Profile(values) => {
            let stat = statistical::check_profile(values.view(), time, checks, now);
            let mut flags = stat.mapv(|f| if f { STATISTICAL_BIT } else { 0 });
            if let Some(instr) = instrument_composite {
                if instr.dim() == values.dim() {
                    flags += instr;
                }
            }
            FlagData::Profile(flags)
        }
    }
}
