//! Parsing of `coefficient × name` strings found in accounting-table cells
//! and initial-value fields.

use std::fmt;

/// A coefficient applied to a named variable, e.g. `-2.5 interest`.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowCoef {
    pub coef: f64,
    pub name: String,
}

impl FlowCoef {
    /// Parses `formula`.
    ///
    /// A leading number becomes the coefficient. Without one, a leading `-`
    /// means a coefficient of -1, otherwise 1. An empty formula has a zero
    /// coefficient. `inf` and `nan` prefixes are kept as part of the name so
    /// that names such as `inflation` survive.
    pub fn parse(formula: &str) -> Self {
        let trimmed = formula.trim_start();
        let numeric = if starts_with_non_finite(trimmed) {
            None
        } else {
            leading_number(trimmed)
        };

        match numeric {
            Some((coef, len)) => FlowCoef {
                coef,
                name: trimmed[len..].trim().to_string(),
            },
            None => {
                if trimmed.is_empty() {
                    return FlowCoef {
                        coef: 0.0,
                        name: String::new(),
                    };
                }
                match trimmed.strip_prefix('-') {
                    Some(rest) => FlowCoef {
                        coef: -1.0,
                        name: rest.trim().to_string(),
                    },
                    None => FlowCoef {
                        coef: 1.0,
                        name: trimmed.trim().to_string(),
                    },
                }
            }
        }
    }
}

impl fmt::Display for FlowCoef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.name.is_empty() {
            write!(f, "{}", self.coef)
        } else if self.coef == 1.0 {
            f.write_str(&self.name)
        } else if self.coef == -1.0 {
            write!(f, "-{}", self.name)
        } else {
            write!(f, "{} {}", self.coef, self.name)
        }
    }
}

fn starts_with_non_finite(s: &str) -> bool {
    let unsigned = s.strip_prefix(['+', '-']).unwrap_or(s).trim_start();
    let lower = unsigned
        .chars()
        .take(3)
        .collect::<String>()
        .to_ascii_lowercase();
    lower == "inf" || lower == "nan"
}

/// Longest prefix of `s` that reads as a decimal floating point number.
fn leading_number(s: &str) -> Option<(f64, usize)> {
    let bytes = s.as_bytes();
    let mut pos = 0;
    if matches!(bytes.first(), Some(b'+') | Some(b'-')) {
        pos += 1;
    }
    let int_start = pos;
    while pos < bytes.len() && bytes[pos].is_ascii_digit() {
        pos += 1;
    }
    let mut digits = pos - int_start;
    if pos < bytes.len() && bytes[pos] == b'.' {
        let frac_start = pos + 1;
        let mut end = frac_start;
        while end < bytes.len() && bytes[end].is_ascii_digit() {
            end += 1;
        }
        digits += end - frac_start;
        if digits > 0 {
            pos = end;
        }
    }
    if digits == 0 {
        return None;
    }
    if pos < bytes.len() && (bytes[pos] == b'e' || bytes[pos] == b'E') {
        let mut end = pos + 1;
        if matches!(bytes.get(end), Some(b'+') | Some(b'-')) {
            end += 1;
        }
        let exp_start = end;
        while end < bytes.len() && bytes[end].is_ascii_digit() {
            end += 1;
        }
        if end > exp_start {
            pos = end;
        }
    }
    s[..pos].parse::<f64>().ok().map(|value| (value, pos))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coef(formula: &str) -> (f64, String) {
        let fc = FlowCoef::parse(formula);
        (fc.coef, fc.name)
    }

    #[test]
    fn leading_number_becomes_coefficient() {
        assert_eq!(coef("2.5 wages"), (2.5, "wages".to_string()));
        assert_eq!(coef("-3x"), (-3.0, "x".to_string()));
        assert_eq!(coef("1e2 y"), (100.0, "y".to_string()));
        assert_eq!(coef("42"), (42.0, String::new()));
    }

    #[test]
    fn sign_without_number_is_unit_coefficient() {
        assert_eq!(coef("-interest"), (-1.0, "interest".to_string()));
        assert_eq!(coef("  interest "), (1.0, "interest".to_string()));
    }

    #[test]
    fn empty_cell_has_zero_coefficient() {
        assert_eq!(coef("   "), (0.0, String::new()));
    }

    #[test]
    fn inf_and_nan_prefixes_are_names() {
        assert_eq!(coef("inflation"), (1.0, "inflation".to_string()));
        assert_eq!(coef("-nancy"), (-1.0, "nancy".to_string()));
    }

    #[test]
    fn exponent_marker_without_digits_belongs_to_name() {
        assert_eq!(coef("2e"), (2.0, "e".to_string()));
    }

    #[test]
    fn display_collapses_unit_coefficients() {
        assert_eq!(FlowCoef::parse("-x").to_string(), "-x");
        assert_eq!(FlowCoef::parse("x").to_string(), "x");
        assert_eq!(FlowCoef::parse("2x").to_string(), "2 x");
    }

    #[test]
    fn display_reparses_to_the_same_coefficient() {
        for formula in ["2 e5", "-1.5 E2", "3 interest", "0.5e-3 y"] {
            let fc = FlowCoef::parse(formula);
            assert_eq!(FlowCoef::parse(&fc.to_string()), fc, "{formula}");
        }
        assert_eq!(FlowCoef::parse("2 e5").to_string(), "2 e5");
    }
}
