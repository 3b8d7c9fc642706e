//! Meter readings and the summary format-template renderer.
//!
//! A template is literal text with exactly one placeholder:
//!
//! ```text
//! {[selector]:[width][.precision][type]}
//! ```
//!
//! - `selector` is empty or `[n]`, indexing into a [`Reading::Pair`]
//!   (`[0]` is the mean of a running average, `[1]` its deviation).
//! - `type` is `d` (integer), `e` (scientific, two-digit signed exponent),
//!   `f` (fixed point) or omitted (plain display).
//! - `{{` and `}}` are literal braces.
//!
//! Rendering errors are configuration bugs and surface as
//! [`ExperimentError::Template`].

use crate::error::{ExperimentError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A meter's current value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Reading {
    Integer(i64),
    Scalar(f64),
    /// Tuple-like reading; index 0 is the primary value.
    Pair(f64, f64),
    Text(String),
}

impl Reading {
    fn select(&self, index: usize) -> Option<Reading> {
        match (self, index) {
            (Reading::Pair(a, _), 0) => Some(Reading::Scalar(*a)),
            (Reading::Pair(_, b), 1) => Some(Reading::Scalar(*b)),
            _ => None,
        }
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            Reading::Integer(i) => Some(*i as f64),
            Reading::Scalar(f) => Some(*f),
            _ => None,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Reading::Integer(_) => "integer",
            Reading::Scalar(_) => "scalar",
            Reading::Pair(..) => "pair",
            Reading::Text(_) => "text",
        }
    }
}

impl fmt::Display for Reading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reading::Integer(i) => write!(f, "{i}"),
            Reading::Scalar(v) => write!(f, "{v}"),
            Reading::Pair(a, b) => write!(f, "({a}, {b})"),
            Reading::Text(s) => f.write_str(s),
        }
    }
}

impl From<usize> for Reading {
    fn from(value: usize) -> Self {
        Reading::Integer(value as i64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Integer,
    Exponent,
    Fixed,
    Plain,
}

#[derive(Debug, Default, PartialEq, Eq)]
struct Spec {
    width: Option<usize>,
    precision: Option<usize>,
}

/// A parsed format template.
#[derive(Debug)]
struct Template<'a> {
    prefix: String,
    suffix: String,
    selector: Option<usize>,
    spec: Spec,
    kind: Kind,
    raw: &'a str,
}

impl<'a> Template<'a> {
    fn parse(raw: &'a str) -> Result<Self> {
        let err = |reason: &str| ExperimentError::template(raw, reason);

        let mut prefix = String::new();
        let mut suffix = String::new();
        let mut field: Option<String> = None;
        let mut chars = raw.chars().peekable();

        while let Some(c) = chars.next() {
            let out = if field.is_some() {
                &mut suffix
            } else {
                &mut prefix
            };
            match c {
                '{' if chars.peek() == Some(&'{') => {
                    chars.next();
                    out.push('{');
                }
                '}' if chars.peek() == Some(&'}') => {
                    chars.next();
                    out.push('}');
                }
                '{' => {
                    if field.is_some() {
                        return Err(err("more than one placeholder"));
                    }
                    let mut inner = String::new();
                    loop {
                        match chars.next() {
                            Some('}') => break,
                            Some('{') => return Err(err("nested '{' in placeholder")),
                            Some(ch) => inner.push(ch),
                            None => return Err(err("unclosed placeholder")),
                        }
                    }
                    field = Some(inner);
                }
                '}' => return Err(err("single '}' outside a placeholder")),
                other => out.push(other),
            }
        }

        let field = field.ok_or_else(|| err("no placeholder"))?;
        let (selector, spec_str) = match field.split_once(':') {
            Some((sel, spec)) => (sel, spec),
            None => (field.as_str(), ""),
        };

        let selector = if selector.is_empty() {
            None
        } else {
            let index = selector
                .strip_prefix('[')
                .and_then(|s| s.strip_suffix(']'))
                .and_then(|s| s.parse::<usize>().ok())
                .ok_or_else(|| err(&format!("invalid selector '{selector}'")))?;
            Some(index)
        };

        let (spec, kind) = parse_spec(spec_str).map_err(|reason| err(&reason))?;

        Ok(Self {
            prefix,
            suffix,
            selector,
            spec,
            kind,
            raw,
        })
    }

    fn render(&self, reading: &Reading) -> Result<String> {
        let err = |reason: String| ExperimentError::template(self.raw, reason);

        let selected;
        let value = match self.selector {
            Some(index) => {
                selected = reading.select(index).ok_or_else(|| {
                    err(format!(
                        "cannot index {} reading with [{index}]",
                        reading.kind()
                    ))
                })?;
                &selected
            }
            None => reading,
        };

        let body = match self.kind {
            Kind::Integer => match value {
                Reading::Integer(i) => i.to_string(),
                other => {
                    return Err(err(format!(
                        "format type 'd' requires an integer, got {}",
                        other.kind()
                    )));
                }
            },
            Kind::Exponent => {
                let v = value.as_f64().ok_or_else(|| {
                    err(format!("format type 'e' requires a number, got {}", value.kind()))
                })?;
                format_exponent(v, self.spec.precision.unwrap_or(6))
            }
            Kind::Fixed => {
                let v = value.as_f64().ok_or_else(|| {
                    err(format!("format type 'f' requires a number, got {}", value.kind()))
                })?;
                format_fixed(v, self.spec.precision.unwrap_or(6))
            }
            Kind::Plain => match (value, self.spec.precision) {
                (Reading::Scalar(v), Some(p)) => format_fixed(*v, p),
                (Reading::Text(s), Some(p)) => s.chars().take(p).collect(),
                (other, _) => other.to_string(),
            },
        };

        let padded = match self.spec.width {
            Some(width) if body.chars().count() < width => {
                let fill = " ".repeat(width - body.chars().count());
                if matches!(value, Reading::Text(_)) {
                    format!("{body}{fill}")
                } else {
                    format!("{fill}{body}")
                }
            }
            _ => body,
        };

        Ok(format!("{}{}{}", self.prefix, padded, self.suffix))
    }
}

fn parse_spec(spec: &str) -> std::result::Result<(Spec, Kind), String> {
    let (body, kind) = match spec.chars().last() {
        Some('d') => (&spec[..spec.len() - 1], Kind::Integer),
        Some('e') => (&spec[..spec.len() - 1], Kind::Exponent),
        Some('f') => (&spec[..spec.len() - 1], Kind::Fixed),
        Some(c) if c.is_ascii_alphabetic() => {
            return Err(format!("unknown format type '{c}'"));
        }
        _ => (spec, Kind::Plain),
    };

    let (width, precision) = match body.split_once('.') {
        Some((w, p)) => (w, Some(p)),
        None => (body, None),
    };

    let width = if width.is_empty() {
        None
    } else {
        Some(
            width
                .parse::<usize>()
                .map_err(|_| format!("invalid width '{width}'"))?,
        )
    };
    let precision = match precision {
        Some(p) => Some(
            p.parse::<usize>()
                .map_err(|_| format!("invalid precision '{p}'"))?,
        ),
        None => None,
    };

    if kind == Kind::Integer && precision.is_some() {
        return Err("precision not allowed with format type 'd'".into());
    }

    Ok((Spec { width, precision }, kind))
}

fn format_fixed(v: f64, precision: usize) -> String {
    if v.is_nan() {
        return "nan".into();
    }
    if v.is_infinite() {
        return if v > 0.0 { "inf".into() } else { "-inf".into() };
    }
    format!("{v:.precision$}")
}

/// Scientific notation with a signed, zero-padded two-digit exponent.
fn format_exponent(v: f64, precision: usize) -> String {
    if !v.is_finite() {
        return format_fixed(v, precision);
    }
    let raw = format!("{v:.precision$e}");
    match raw.split_once('e') {
        Some((mantissa, exp)) => {
            let exp: i32 = exp.parse().unwrap_or(0);
            let sign = if exp < 0 { '-' } else { '+' };
            format!("{mantissa}e{sign}{:02}", exp.abs())
        }
        None => raw,
    }
}

/// Render `reading` through `template`.
pub fn render(template: &str, reading: &Reading) -> Result<String> {
    Template::parse(template)?.render(reading)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponent_matches_two_digit_convention() {
        assert_eq!(render("{:.3e}", &Reading::Scalar(0.4)).unwrap(), "4.000e-01");
        assert_eq!(
            render("{:.3e}", &Reading::Scalar(0.01234)).unwrap(),
            "1.234e-02"
        );
        assert_eq!(render("{:.2e}", &Reading::Scalar(1500.0)).unwrap(), "1.50e+03");
        assert_eq!(render("{:.1e}", &Reading::Scalar(0.0)).unwrap(), "0.0e+00");
    }

    #[test]
    fn test_pair_selector() {
        let reading = Reading::Pair(0.4, 0.1);
        assert_eq!(render("{[0]:.3e}", &reading).unwrap(), "4.000e-01");
        assert_eq!(render("{[1]:.2f}", &reading).unwrap(), "0.10");
        assert!(render("{[2]:.2f}", &reading).is_err());
        assert!(render("{[0]:.2f}", &Reading::Scalar(1.0)).is_err());
    }

    #[test]
    fn test_fixed_with_suffix() {
        assert_eq!(render("{:.2f}s", &Reading::Scalar(2.0)).unwrap(), "2.00s");
        assert_eq!(render("{:.2f}s", &Reading::Scalar(12.5)).unwrap(), "12.50s");
    }

    #[test]
    fn test_integer_and_width() {
        assert_eq!(render("{:d}", &Reading::Integer(1)).unwrap(), "1");
        assert_eq!(render("{:4d}", &Reading::Integer(3)).unwrap(), "   3");
        assert!(render("{:d}", &Reading::Scalar(1.0)).is_err());
        assert!(render("{:.2d}", &Reading::Integer(1)).is_err());
    }

    #[test]
    fn test_plain_display() {
        assert_eq!(
            render("{}", &Reading::Text("512MB".into())).unwrap(),
            "512MB"
        );
        assert_eq!(render("{:6}", &Reading::Text("ab".into())).unwrap(), "ab    ");
        assert_eq!(render("{}", &Reading::Integer(7)).unwrap(), "7");
    }

    #[test]
    fn test_literal_braces() {
        assert_eq!(
            render("{{{:d}}}", &Reading::Integer(5)).unwrap(),
            "{5}"
        );
    }

    #[test]
    fn test_malformed_templates() {
        for bad in ["", "no placeholder", "{", "{:d", "{}{}", "}", "{:q}", "{x}", "{:.xf}"] {
            assert!(
                matches!(
                    render(bad, &Reading::Integer(1)),
                    Err(ExperimentError::Template { .. })
                ),
                "expected template error for {bad:?}"
            );
        }
    }

    #[test]
    fn test_non_finite_values() {
        assert_eq!(render("{:.3e}", &Reading::Scalar(f64::NAN)).unwrap(), "nan");
        assert_eq!(render("{:.2f}", &Reading::Scalar(f64::INFINITY)).unwrap(), "inf");
    }

    #[test]
    fn test_text_rejects_numeric_types() {
        assert!(render("{:.2f}", &Reading::Text("x".into())).is_err());
        assert!(render("{:e}", &Reading::Text("x".into())).is_err());
    }
}
