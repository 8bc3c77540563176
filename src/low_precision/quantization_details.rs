//! Fake-quantize interval details and precision selection

use crate::graph::{GraphContext, NodeId, Op};
use crate::tensor::ElementType;

/// Quantization levels the pipeline lowers
pub const SUPPORTED_LEVELS: [usize; 2] = [255, 256];

const ZERO_TOLERANCE: f32 = 1e-7;
const RATIO_TOLERANCE: f32 = 1e-4;

/// Intervals of a fake-quantize whose range inputs are constants
///
/// Each range holds one value per interval; a single value applies to every
/// interval.
#[derive(Debug, Clone, PartialEq)]
pub struct QuantizationDetails {
    /// Number of levels
    pub levels: usize,
    /// Input interval lows
    pub input_low: Vec<f32>,
    /// Input interval highs
    pub input_high: Vec<f32>,
    /// Output interval lows
    pub output_low: Vec<f32>,
    /// Output interval highs
    pub output_high: Vec<f32>,
}

impl QuantizationDetails {
    /// Read the details of a fake-quantize node
    ///
    /// Returns `None` when the node is not a fake-quantize, any range input
    /// is not a constant, or the range lengths disagree.
    pub fn from_fake_quantize(graph: &GraphContext, fq: NodeId) -> Option<Self> {
        let node = graph.get_node(fq)?;
        let Op::FakeQuantize { levels } = node.op else {
            return None;
        };
        let range = |index: usize| graph.get_constant_input(fq, index).map(|c| c.to_vec());
        let details = Self {
            levels,
            input_low: range(1)?,
            input_high: range(2)?,
            output_low: range(3)?,
            output_high: range(4)?,
        };
        details.is_consistent().then_some(details)
    }

    /// Check that every range holds either one value or one per interval
    pub fn is_consistent(&self) -> bool {
        let count = self.intervals_count();
        [
            &self.input_low,
            &self.input_high,
            &self.output_low,
            &self.output_high,
        ]
        .iter()
        .all(|range| range.len() == 1 || range.len() == count)
    }

    /// Check if the number of levels is lowerable
    pub fn is_supported_level(levels: usize) -> bool {
        SUPPORTED_LEVELS.contains(&levels)
    }

    /// Number of intervals
    pub fn intervals_count(&self) -> usize {
        [
            self.input_low.len(),
            self.input_high.len(),
            self.output_low.len(),
            self.output_high.len(),
        ]
        .into_iter()
        .max()
        .unwrap_or(0)
    }

    /// Input low of interval `i`
    pub fn input_low_value(&self, i: usize) -> f32 {
        value_at(&self.input_low, i)
    }

    /// Input high of interval `i`
    pub fn input_high_value(&self, i: usize) -> f32 {
        value_at(&self.input_high, i)
    }

    /// Output low of interval `i`
    pub fn output_low_value(&self, i: usize) -> f32 {
        value_at(&self.output_low, i)
    }

    /// Output high of interval `i`
    pub fn output_high_value(&self, i: usize) -> f32 {
        value_at(&self.output_high, i)
    }

    /// Check that every output interval has positive width
    pub fn has_valid_intervals(&self) -> bool {
        (0..self.intervals_count())
            .all(|i| self.output_high_value(i) - self.output_low_value(i) > ZERO_TOLERANCE)
    }

    /// Smallest output low over all intervals
    pub fn min_output_low(&self) -> f32 {
        self.output_low.iter().copied().fold(f32::INFINITY, f32::min)
    }

    /// Largest output high over all intervals
    pub fn max_output_high(&self) -> f32 {
        self.output_high.iter().copied().fold(f32::NEG_INFINITY, f32::max)
    }

    /// Check if the output intervals already are the quantized bounds
    pub fn outputs_are(&self, min: f32, max: f32) -> bool {
        (0..self.intervals_count()).all(|i| {
            (self.output_low_value(i) - min).abs() < ZERO_TOLERANCE
                && (self.output_high_value(i) - max).abs() < ZERO_TOLERANCE
        })
    }

    /// Precision the output intervals naturally map onto, if any
    ///
    /// All lows zero maps onto `u8`; signed intervals whose low/high ratio is
    /// the `i8` ratio for these levels map onto `i8`.
    pub fn detected_precision(&self) -> Option<ElementType> {
        let count = self.intervals_count();
        if count == 0 {
            return None;
        }
        if (0..count).all(|i| self.output_low_value(i).abs() < ZERO_TOLERANCE) {
            return Some(ElementType::U8);
        }
        let (min, max) = quantized_bounds(ElementType::I8, self.levels)?;
        let expected = min / max;
        let symmetric = (0..count).all(|i| {
            let low = self.output_low_value(i);
            let high = self.output_high_value(i);
            low < 0.0 && high > 0.0 && (low / high - expected).abs() < RATIO_TOLERANCE
        });
        symmetric.then_some(ElementType::I8)
    }
}

fn value_at(values: &[f32], i: usize) -> f32 {
    debug_assert!(
        values.len() == 1 || i < values.len(),
        "interval {} out of range for {} values",
        i,
        values.len()
    );
    match values {
        [single] => *single,
        _ => values.get(i).copied().unwrap_or(f32::NAN),
    }
}

/// Quantized integer bounds for a precision and level count
pub fn quantized_bounds(precision: ElementType, levels: usize) -> Option<(f32, f32)> {
    match precision {
        ElementType::U8 => Some((0.0, levels as f32 - 1.0)),
        ElementType::I8 => match levels {
            256 => Some((-128.0, 127.0)),
            255 => Some((-127.0, 127.0)),
            _ => None,
        },
        _ => None,
    }
}

/// Precision chosen for a fake-quantize
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DataPrecision {
    /// Integer element type
    pub precision: ElementType,
    /// Lowest quantized value
    pub min: f32,
    /// Highest quantized value
    pub max: f32,
    /// A zero-point subtraction is required
    pub has_zero_point: bool,
}

impl DataPrecision {
    /// Scale and shift for interval `i`
    ///
    /// `real = scale * (q - shift)` maps the quantized bounds back onto the
    /// output interval.
    pub fn scale_shift(&self, details: &QuantizationDetails, i: usize) -> (f32, f32) {
        let low = details.output_low_value(i);
        let high = details.output_high_value(i);
        let scale = (high - low) / (self.max - self.min);
        let shift = self.min - low / scale;
        (scale, shift)
    }
}

/// Select the precision for a fake-quantize
///
/// A detected precision that is allowed is used without zero point.
/// Otherwise the first allowed precision is used with a zero point, which is
/// only acceptable when asymmetric quantization is supported.
pub fn get_data_precision(
    details: &QuantizationDetails,
    allowed: &[ElementType],
    support_asymmetric_quantization: bool,
) -> Option<DataPrecision> {
    if !QuantizationDetails::is_supported_level(details.levels)
        || !details.is_consistent()
        || !details.has_valid_intervals()
    {
        return None;
    }
    let (precision, has_zero_point) = match details.detected_precision() {
        Some(detected) if allowed.contains(&detected) => (detected, false),
        _ => (*allowed.first()?, true),
    };
    if has_zero_point && !support_asymmetric_quantization {
        return None;
    }
    let (min, max) = quantized_bounds(precision, details.levels)?;
    Some(DataPrecision {
        precision,
        min,
        max,
        has_zero_point,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn details(levels: usize, low: f32, high: f32) -> QuantizationDetails {
        QuantizationDetails {
            levels,
            input_low: vec![low],
            input_high: vec![high],
            output_low: vec![low],
            output_high: vec![high],
        }
    }

    fn assert_close(actual: f32, expected: f32) {
        assert!(
            (actual - expected).abs() < 1e-4,
            "expected {}, got {}",
            expected,
            actual
        );
    }

    #[test]
    fn test_detected_precision() {
        assert_eq!(details(256, 0.0, 2.55).detected_precision(), Some(ElementType::U8));
        assert_eq!(details(256, -1.28, 1.27).detected_precision(), Some(ElementType::I8));
        assert_eq!(details(255, -1.27, 1.27).detected_precision(), Some(ElementType::I8));
        assert_eq!(details(256, -1.23, 2.55).detected_precision(), None);
    }

    #[test]
    fn test_u8_without_zero_point() {
        let d = details(256, 0.0, 2.55);
        let p = get_data_precision(&d, &[ElementType::U8], true).unwrap();
        assert_eq!(p.precision, ElementType::U8);
        assert!(!p.has_zero_point);
        let (scale, shift) = p.scale_shift(&d, 0);
        assert_close(scale, 0.01);
        assert_close(shift, 0.0);
    }

    #[test]
    fn test_asymmetric_u8() {
        let d = details(256, -1.23, 2.55);
        let p = get_data_precision(&d, &[ElementType::U8], true).unwrap();
        assert!(p.has_zero_point);
        let (scale, shift) = p.scale_shift(&d, 0);
        assert_close(scale, 0.014823529);
        assert!((shift - 82.97619).abs() < 1e-3);
        assert!(get_data_precision(&d, &[ElementType::U8], false).is_none());
    }

    #[test]
    fn test_signed_interval_on_unsigned_precision() {
        let d = details(256, -1.28, 1.27);
        let p = get_data_precision(&d, &[ElementType::U8], true).unwrap();
        assert_eq!(p.precision, ElementType::U8);
        let (scale, shift) = p.scale_shift(&d, 0);
        assert_close(scale, 0.01);
        assert!((shift - 128.0).abs() < 1e-3);
    }

    #[test]
    fn test_i8_cases() {
        let d = details(256, -1.28, 1.27);
        let p = get_data_precision(&d, &[ElementType::I8], true).unwrap();
        assert!(!p.has_zero_point);
        assert_eq!((p.min, p.max), (-128.0, 127.0));
        assert_close(p.scale_shift(&d, 0).0, 0.01);

        let d = details(256, -0.12, 1.27);
        let p = get_data_precision(&d, &[ElementType::I8], true).unwrap();
        let (scale, shift) = p.scale_shift(&d, 0);
        assert_close(scale, 0.00545098);
        assert!((shift + 105.98561).abs() < 1e-3);

        let d = details(256, 0.0, 2.55);
        let p = get_data_precision(&d, &[ElementType::I8], true).unwrap();
        assert!(p.has_zero_point);
        assert!((p.scale_shift(&d, 0).1 + 128.0).abs() < 1e-3);
    }

    #[test]
    fn test_unsupported() {
        assert!(get_data_precision(&details(16, 0.0, 1.0), &[ElementType::U8], true).is_none());
        assert!(get_data_precision(&details(256, 1.0, 1.0), &[ElementType::U8], true).is_none());
        assert!(get_data_precision(&details(256, 0.0, 1.0), &[], true).is_none());
    }

    #[test]
    fn test_mismatched_range_lengths() {
        let d = QuantizationDetails {
            levels: 256,
            input_low: vec![0.0],
            input_high: vec![2.55, 1.27],
            output_low: vec![0.0],
            output_high: vec![2.55, 1.27, 0.63],
        };
        assert_eq!(d.intervals_count(), 3);
        assert!(!d.is_consistent());
        assert!(get_data_precision(&d, &[ElementType::U8], true).is_none());

        let d = QuantizationDetails {
            input_high: vec![2.55, 1.27, 0.63],
            ..d
        };
        assert!(d.is_consistent());
        assert_close(d.input_high_value(2), 0.63);
        assert_close(d.input_low_value(2), 0.0);
    }

    #[test]
    fn test_mismatched_fake_quantize_has_no_details() {
        use crate::graph::{GraphContext, Op};
        use crate::tensor::Constant;

        // Ranges broadcast onto [1, 3, 2, 1] along different axes
        let mut graph = GraphContext::new();
        let x = graph.add_parameter("x", ElementType::F32, vec![1, 3, 2, 1]);
        let mut range = |shape: &[usize], values: Vec<f32>| {
            graph.add_constant(Constant::from_vec(ElementType::F32, shape, values).unwrap())
        };
        let low = range(&[], vec![0.0]);
        let high = range(&[1, 1, 2, 1], vec![2.55, 1.27]);
        let out_low = range(&[], vec![0.0]);
        let out_high = range(&[1, 3, 1, 1], vec![2.55, 1.27, 0.63]);
        let fq = graph
            .add_node(Op::FakeQuantize { levels: 256 }, &[x, low, high, out_low, out_high])
            .unwrap();
        assert!(QuantizationDetails::from_fake_quantize(&graph, fq).is_none());
    }

    #[test]
    fn test_quantized_bounds() {
        assert_eq!(quantized_bounds(ElementType::U8, 256), Some((0.0, 255.0)));
        assert_eq!(quantized_bounds(ElementType::I8, 255), Some((-127.0, 127.0)));
        assert_eq!(quantized_bounds(ElementType::F32, 256), None);
    }
}
