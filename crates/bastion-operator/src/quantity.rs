//! Canonical form of Kubernetes resource quantities
//!
//! The API server rewrites every quantity it stores: `cpu: "0.5"` comes back
//! as `500m`, `memory: "1024Mi"` as `1Gi`. Desired and observed objects are
//! compared in this canonical form so the rewrite never shows up as drift.

use crate::store::ObjectKind;
use serde_json::Value;

/// Binary SI suffixes and their power of 1024
const BINARY_SUFFIXES: [(&str, u32); 6] = [
    ("Ki", 1),
    ("Mi", 2),
    ("Gi", 3),
    ("Ti", 4),
    ("Pi", 5),
    ("Ei", 6),
];

/// Decimal SI suffixes and their power of 10
const DECIMAL_SUFFIXES: [(&str, i32); 10] = [
    ("n", -9),
    ("u", -6),
    ("m", -3),
    ("", 0),
    ("k", 3),
    ("M", 6),
    ("G", 9),
    ("T", 12),
    ("P", 15),
    ("E", 18),
];

/// Longer mantissas are left alone rather than risk overflow
const MAX_DIGITS: usize = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    DecimalSi,
    BinarySi,
    DecimalExponent,
}

/// Canonical spelling of `raw`, or `None` when it does not parse
pub fn canonical(raw: &str) -> Option<String> {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| !(c.is_ascii_digit() || matches!(c, '.' | '+' | '-')))
        .unwrap_or(raw.len());
    let (number, suffix) = raw.split_at(split);
    let (mut mantissa, mut exponent) = parse_number(number)?;

    let format = if let Some((_, power)) = BINARY_SUFFIXES.iter().find(|(s, _)| *s == suffix) {
        mantissa = mantissa.checked_mul(1024i128.checked_pow(*power)?)?;
        Format::BinarySi
    } else if let Some((_, power)) = DECIMAL_SUFFIXES.iter().find(|(s, _)| *s == suffix) {
        exponent = exponent.checked_add(*power)?;
        Format::DecimalSi
    } else if let Some(power) = suffix.strip_prefix(['e', 'E']) {
        exponent = exponent.checked_add(power.parse::<i32>().ok()?)?;
        Format::DecimalExponent
    } else {
        return None;
    };

    if mantissa == 0 {
        return Some("0".to_string());
    }
    (mantissa, exponent) = strip_zeros(mantissa, exponent);
    // Nothing below nano survives; the server rounds up
    if exponent < -9 {
        let scale = pow10(-9 - exponent)?;
        let rounded = mantissa / scale;
        mantissa = if mantissa % scale > 0 { rounded + 1 } else { rounded };
        (mantissa, exponent) = strip_zeros(mantissa, -9);
    }

    match format {
        Format::BinarySi if exponent >= 0 => {
            let value = mantissa.checked_mul(pow10(exponent)?)?;
            let (unit, suffix) = BINARY_SUFFIXES
                .iter()
                .rev()
                .map(|(suffix, power)| (1024i128.pow(*power), *suffix))
                .find(|(unit, _)| value % unit == 0)
                .unwrap_or((1, ""));
            Some(format!("{}{}", value / unit, suffix))
        }
        Format::DecimalExponent => {
            let scaled = exponent.div_euclid(3) * 3;
            let mantissa = mantissa.checked_mul(pow10(exponent - scaled)?)?;
            Some(if scaled == 0 {
                mantissa.to_string()
            } else {
                format!("{}e{}", mantissa, scaled)
            })
        }
        // Fractional binary amounts fall back to decimal SI
        Format::BinarySi | Format::DecimalSi => {
            let scaled = (exponent.div_euclid(3) * 3).clamp(-9, 18);
            let mantissa = mantissa.checked_mul(pow10(exponent - scaled)?)?;
            let suffix = DECIMAL_SUFFIXES
                .iter()
                .find(|(_, power)| *power == scaled)
                .map(|(suffix, _)| *suffix)?;
            Some(format!("{}{}", mantissa, suffix))
        }
    }
}

fn parse_number(number: &str) -> Option<(i128, i32)> {
    let (negative, digits) = match number.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, number.strip_prefix('+').unwrap_or(number)),
    };
    let (whole, fraction) = digits.split_once('.').unwrap_or((digits, ""));
    if whole.is_empty() && fraction.is_empty() {
        return None;
    }
    if !whole.chars().chain(fraction.chars()).all(|c| c.is_ascii_digit()) {
        return None;
    }
    let all = format!("{}{}", whole, fraction);
    let significant = all.trim_start_matches('0');
    if significant.len() > MAX_DIGITS {
        return None;
    }
    let magnitude: i128 = if significant.is_empty() {
        0
    } else {
        significant.parse().ok()?
    };
    let exponent = -i32::try_from(fraction.len()).ok()?;
    Some((if negative { -magnitude } else { magnitude }, exponent))
}

fn strip_zeros(mut mantissa: i128, mut exponent: i32) -> (i128, i32) {
    while mantissa != 0 && mantissa % 10 == 0 {
        mantissa /= 10;
        exponent += 1;
    }
    (mantissa, exponent)
}

fn pow10(exponent: i32) -> Option<i128> {
    10i128.checked_pow(u32::try_from(exponent).ok()?)
}

/// Rewrite every resource quantity of `object` (a serialized object of `kind`)
/// into canonical form. Values that do not parse are left untouched.
pub fn canonicalize_resources(kind: ObjectKind, object: &mut Value) {
    match kind {
        ObjectKind::Deployment | ObjectKind::DaemonSet => {
            for list in ["containers", "initContainers"] {
                let pointer = format!("/spec/template/spec/{}", list);
                let Some(containers) = object.pointer_mut(&pointer).and_then(Value::as_array_mut)
                else {
                    continue;
                };
                for container in containers {
                    if let Some(resources) = container.get_mut("resources") {
                        canonicalize_amounts(resources);
                    }
                }
            }
        }
        ObjectKind::PersistentVolumeClaim => {
            if let Some(resources) = object.pointer_mut("/spec/resources") {
                canonicalize_amounts(resources);
            }
        }
        _ => {}
    }
}

/// `limits` and `requests` of one resource requirements block
fn canonicalize_amounts(resources: &mut Value) {
    for section in ["limits", "requests"] {
        let Some(amounts) = resources.get_mut(section).and_then(Value::as_object_mut) else {
            continue;
        };
        for amount in amounts.values_mut() {
            if let Some(canonical) = amount.as_str().and_then(canonical) {
                *amount = Value::String(canonical);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decimal_quantities() {
        assert_eq!(canonical("0.5").as_deref(), Some("500m"));
        assert_eq!(canonical("1.0").as_deref(), Some("1"));
        assert_eq!(canonical("1000m").as_deref(), Some("1"));
        assert_eq!(canonical("1500m").as_deref(), Some("1500m"));
        assert_eq!(canonical("250m").as_deref(), Some("250m"));
        assert_eq!(canonical("1000").as_deref(), Some("1k"));
        assert_eq!(canonical("100M").as_deref(), Some("100M"));
        assert_eq!(canonical("128974848").as_deref(), Some("128974848"));
        assert_eq!(canonical("0").as_deref(), Some("0"));
    }

    #[test]
    fn test_binary_quantities() {
        assert_eq!(canonical("1024Mi").as_deref(), Some("1Gi"));
        assert_eq!(canonical("0.5Gi").as_deref(), Some("512Mi"));
        assert_eq!(canonical("1.5Gi").as_deref(), Some("1536Mi"));
        assert_eq!(canonical("50Gi").as_deref(), Some("50Gi"));
        assert_eq!(canonical("0.1Ki").as_deref(), Some("102400m"));
    }

    #[test]
    fn test_exponent_and_rounding() {
        assert_eq!(canonical("1e3").as_deref(), Some("1e3"));
        assert_eq!(canonical("1.5e3").as_deref(), Some("1500"));
        assert_eq!(canonical("0.0000000001").as_deref(), Some("1n"));
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert_eq!(canonical("lots"), None);
        assert_eq!(canonical("1Xi"), None);
        assert_eq!(canonical(""), None);
    }

    #[test]
    fn test_canonicalize_container_resources() {
        let mut deployment = json!({
            "spec": {"template": {"spec": {"containers": [{
                "name": "gateway",
                "resources": {
                    "requests": {"cpu": "0.5", "memory": "1024Mi"},
                    "limits": {"cpu": "2.0", "nvidia.com/gpu": "1"}
                }
            }]}}}
        });
        canonicalize_resources(ObjectKind::Deployment, &mut deployment);
        let resources = &deployment["spec"]["template"]["spec"]["containers"][0]["resources"];
        assert_eq!(resources["requests"]["cpu"], "500m");
        assert_eq!(resources["requests"]["memory"], "1Gi");
        assert_eq!(resources["limits"]["cpu"], "2");
        assert_eq!(resources["limits"]["nvidia.com/gpu"], "1");

        let mut claim = json!({"spec": {"resources": {"requests": {"storage": "2048Mi"}}}});
        canonicalize_resources(ObjectKind::PersistentVolumeClaim, &mut claim);
        assert_eq!(claim["spec"]["resources"]["requests"]["storage"], "2Gi");
    }
}
