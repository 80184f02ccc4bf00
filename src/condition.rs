//! MongoDB-style JSON conditions matched against an attribute document.
use std::{cmp::Ordering, fmt, str::FromStr};

use regex::Regex;
use serde_json::{Map, Value};

use crate::models::SavedGroups;

/// Returns `true` if `attributes` satisfy `condition`.
///
/// The condition is a JSON object. Each key is either a logical operator (`$and`, `$or`, `$nor`,
/// `$not`) or a dot-separated attribute path mapped to a literal (implicit equality) or to an
/// operator object such as `{"$gte": 18}`.
///
/// Evaluation is total: unknown operators, type mismatches and malformed operands never match
/// rather than failing. `$inGroup` and `$notInGroup` see every saved group as empty, use
/// [`evaluate_condition_with_saved_groups`] to resolve them.
///
/// ```
/// # use growthbook::evaluate_condition;
/// # use serde_json::json;
/// let condition = json!({"age": {"$gte": 18}, "country": {"$in": ["US", "CA"]}});
/// assert!(evaluate_condition(&json!({"age": 21, "country": "US"}), &condition));
/// assert!(!evaluate_condition(&json!({"age": 17, "country": "US"}), &condition));
/// ```
pub fn evaluate_condition(attributes: &Value, condition: &Value) -> bool {
    evaluate_condition_with_saved_groups(attributes, condition, &SavedGroups::new())
}

/// Same as [`evaluate_condition`], resolving `$inGroup` and `$notInGroup` against
/// `saved_groups`.
///
/// ```
/// # use growthbook::{evaluate_condition_with_saved_groups, SavedGroups};
/// # use serde_json::json;
/// let saved_groups = SavedGroups::from([("beta".to_owned(), json!(["1", "2"]))]);
/// let condition = json!({"id": {"$inGroup": "beta"}});
/// assert!(evaluate_condition_with_saved_groups(&json!({"id": "2"}), &condition, &saved_groups));
/// assert!(!evaluate_condition_with_saved_groups(&json!({"id": "3"}), &condition, &saved_groups));
/// ```
pub fn evaluate_condition_with_saved_groups(
    attributes: &Value,
    condition: &Value,
    saved_groups: &SavedGroups,
) -> bool {
    let Value::Object(condition) = condition else {
        return false;
    };

    condition.iter().all(|(key, value)| match key.as_str() {
        "$or" => eval_or(attributes, value, saved_groups),
        "$nor" => value.is_array() && !eval_or(attributes, value, saved_groups),
        "$and" => eval_and(attributes, value, saved_groups),
        "$not" => !evaluate_condition_with_saved_groups(attributes, value, saved_groups),
        path => eval_condition_value(value, get_path(attributes, path), saved_groups),
    })
}

fn eval_or(attributes: &Value, conditions: &Value, saved_groups: &SavedGroups) -> bool {
    let Value::Array(conditions) = conditions else {
        return false;
    };
    conditions
        .iter()
        .any(|condition| evaluate_condition_with_saved_groups(attributes, condition, saved_groups))
}

fn eval_and(attributes: &Value, conditions: &Value, saved_groups: &SavedGroups) -> bool {
    let Value::Array(conditions) = conditions else {
        return false;
    };
    conditions
        .iter()
        .all(|condition| evaluate_condition_with_saved_groups(attributes, condition, saved_groups))
}

/// Resolve a dot-separated path. `None` stands for "undefined", which is distinct from JSON
/// `null`.
pub(crate) fn get_path<'a>(attributes: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(attributes, |current, segment| match current {
            Value::Object(map) => map.get(segment),
            _ => None,
        })
}

/// An object whose keys all start with `$` is an operator object.
fn is_operator_object(map: &Map<String, Value>) -> bool {
    map.keys().all(|key| key.starts_with('$'))
}

fn eval_condition_value(
    condition_value: &Value,
    attribute: Option<&Value>,
    saved_groups: &SavedGroups,
) -> bool {
    match condition_value {
        Value::Object(map) if is_operator_object(map) => map
            .iter()
            .all(|(op, expected)| eval_operator(op, attribute, expected, saved_groups)),
        Value::Null => matches!(attribute, None | Some(Value::Null)),
        _ => attribute.is_some_and(|attribute| json_equals(attribute, condition_value)),
    }
}

fn eval_operator(
    op: &str,
    attribute: Option<&Value>,
    expected: &Value,
    saved_groups: &SavedGroups,
) -> bool {
    match op.parse::<Operator>() {
        Ok(operator) => operator.eval_with_saved_groups(attribute, expected, saved_groups),
        Err(UnknownOperator) => {
            log::debug!(target: "growthbook", operator = op; "unknown condition operator");
            false
        }
    }
}

/// Deep equality where numbers compare by value, so `1` equals `1.0`.
fn json_equals(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        (Value::Array(a), Value::Array(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(a, b)| json_equals(a, b))
        }
        (Value::Object(a), Value::Object(b)) => {
            a.len() == b.len()
                && a.iter()
                    .all(|(key, a)| b.get(key).is_some_and(|b| json_equals(a, b)))
        }
        _ => a == b,
    }
}

/// Classification used by the `$type` operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    #[allow(missing_docs)]
    String,
    #[allow(missing_docs)]
    Number,
    #[allow(missing_docs)]
    Boolean,
    #[allow(missing_docs)]
    Array,
    #[allow(missing_docs)]
    Object,
    #[allow(missing_docs)]
    Null,
    /// The attribute path does not resolve.
    Undefined,
}

impl DataType {
    /// Classify a resolved attribute.
    pub fn of(value: Option<&Value>) -> DataType {
        match value {
            None => DataType::Undefined,
            Some(Value::Null) => DataType::Null,
            Some(Value::Bool(_)) => DataType::Boolean,
            Some(Value::Number(_)) => DataType::Number,
            Some(Value::String(_)) => DataType::String,
            Some(Value::Array(_)) => DataType::Array,
            Some(Value::Object(_)) => DataType::Object,
        }
    }

    /// Name as written in `$type` conditions.
    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::String => "string",
            DataType::Number => "number",
            DataType::Boolean => "boolean",
            DataType::Array => "array",
            DataType::Object => "object",
            DataType::Null => "null",
            DataType::Undefined => "undefined",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Condition operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    #[allow(missing_docs)]
    Eq,
    #[allow(missing_docs)]
    Ne,
    #[allow(missing_docs)]
    Lt,
    #[allow(missing_docs)]
    Lte,
    #[allow(missing_docs)]
    Gt,
    #[allow(missing_docs)]
    Gte,
    #[allow(missing_docs)]
    VersionEq,
    #[allow(missing_docs)]
    VersionNe,
    #[allow(missing_docs)]
    VersionLt,
    #[allow(missing_docs)]
    VersionLte,
    #[allow(missing_docs)]
    VersionGt,
    #[allow(missing_docs)]
    VersionGte,
    #[allow(missing_docs)]
    In,
    #[allow(missing_docs)]
    Nin,
    #[allow(missing_docs)]
    Regex,
    #[allow(missing_docs)]
    Exists,
    #[allow(missing_docs)]
    Type,
    #[allow(missing_docs)]
    Size,
    #[allow(missing_docs)]
    ElemMatch,
    #[allow(missing_docs)]
    All,
    #[allow(missing_docs)]
    Not,
    /// The attribute (or one of its elements) is in the saved group named by the operand.
    InGroup,
    #[allow(missing_docs)]
    NotInGroup,
}

/// Error returned when parsing an operator token this SDK does not support.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnknownOperator;

impl FromStr for Operator {
    type Err = UnknownOperator;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "$eq" => Operator::Eq,
            "$ne" => Operator::Ne,
            "$lt" => Operator::Lt,
            "$lte" => Operator::Lte,
            "$gt" => Operator::Gt,
            "$gte" => Operator::Gte,
            "$veq" => Operator::VersionEq,
            "$vne" => Operator::VersionNe,
            "$vlt" => Operator::VersionLt,
            "$vlte" => Operator::VersionLte,
            "$vgt" => Operator::VersionGt,
            "$vgte" => Operator::VersionGte,
            "$in" => Operator::In,
            "$nin" => Operator::Nin,
            "$regex" => Operator::Regex,
            "$exists" => Operator::Exists,
            "$type" => Operator::Type,
            "$size" => Operator::Size,
            "$elemMatch" => Operator::ElemMatch,
            "$all" => Operator::All,
            "$not" => Operator::Not,
            "$inGroup" => Operator::InGroup,
            "$notInGroup" => Operator::NotInGroup,
            _ => return Err(UnknownOperator),
        })
    }
}

impl Operator {
    /// Applying `Operator` to the values. Returns `false` if the operator cannot be applied or
    /// there's a misconfiguration.
    pub fn eval(&self, attribute: Option<&Value>, expected: &Value) -> bool {
        self.eval_with_saved_groups(attribute, expected, &SavedGroups::new())
    }

    /// Same as [`Operator::eval`], resolving group operators against `saved_groups`.
    pub fn eval_with_saved_groups(
        &self,
        attribute: Option<&Value>,
        expected: &Value,
        saved_groups: &SavedGroups,
    ) -> bool {
        self.try_eval(attribute, expected, saved_groups)
            .unwrap_or(false)
    }

    /// Try applying `Operator` to the values, returning `None` if the operator cannot be applied.
    fn try_eval(
        &self,
        attribute: Option<&Value>,
        expected: &Value,
        saved_groups: &SavedGroups,
    ) -> Option<bool> {
        match self {
            Self::Eq => Some(json_equals(attribute?, expected)),
            Self::Ne => Some(!attribute.is_some_and(|attribute| json_equals(attribute, expected))),

            Self::Lt | Self::Lte | Self::Gt | Self::Gte => {
                let ordering = compare(attribute?, expected)?;
                Some(match self {
                    Self::Lt => ordering == Ordering::Less,
                    Self::Lte => ordering != Ordering::Greater,
                    Self::Gt => ordering == Ordering::Greater,
                    _ => ordering != Ordering::Less,
                })
            }

            Self::VersionEq
            | Self::VersionNe
            | Self::VersionLt
            | Self::VersionLte
            | Self::VersionGt
            | Self::VersionGte => {
                let actual = padded_version_string(&version_operand(attribute?)?);
                let expected = padded_version_string(&version_operand(expected)?);
                let ordering = actual.cmp(&expected);
                Some(match self {
                    Self::VersionEq => ordering == Ordering::Equal,
                    Self::VersionNe => ordering != Ordering::Equal,
                    Self::VersionLt => ordering == Ordering::Less,
                    Self::VersionLte => ordering != Ordering::Greater,
                    Self::VersionGt => ordering == Ordering::Greater,
                    _ => ordering != Ordering::Less,
                })
            }

            Self::In | Self::Nin => {
                let is_in = is_in(attribute?, expected.as_array()?);
                Some(if matches!(self, Self::In) {
                    is_in
                } else {
                    !is_in
                })
            }

            Self::InGroup | Self::NotInGroup => {
                // Unknown groups are empty.
                let group = expected
                    .as_str()
                    .and_then(|id| saved_groups.get(id))
                    .and_then(Value::as_array)
                    .map(Vec::as_slice)
                    .unwrap_or_default();
                let is_in = attribute.is_some_and(|attribute| is_in(attribute, group));
                Some(if matches!(self, Self::InGroup) {
                    is_in
                } else {
                    !is_in
                })
            }

            Self::Regex => {
                let s = attribute?.as_str()?;
                let regex = Regex::new(expected.as_str()?).ok()?;
                Some(regex.is_match(s))
            }

            Self::Exists => {
                let exists = !matches!(attribute, None | Some(Value::Null));
                Some(exists == expected.as_bool()?)
            }

            Self::Type => Some(DataType::of(attribute).as_str() == expected.as_str()?),

            Self::Size => {
                let len = attribute?.as_array()?.len();
                Some(eval_condition_value(
                    expected,
                    Some(&Value::from(len)),
                    saved_groups,
                ))
            }

            Self::ElemMatch => {
                let items = attribute?.as_array()?;
                let nested_operators = expected.as_object().is_some_and(is_operator_object);
                Some(items.iter().any(|item| {
                    if nested_operators {
                        eval_condition_value(expected, Some(item), saved_groups)
                    } else {
                        evaluate_condition_with_saved_groups(item, expected, saved_groups)
                    }
                }))
            }

            Self::All => {
                let items = attribute?.as_array()?;
                let conditions = expected.as_array()?;
                Some(conditions.iter().all(|condition| {
                    items
                        .iter()
                        .any(|item| eval_condition_value(condition, Some(item), saved_groups))
                }))
            }

            Self::Not => Some(!eval_condition_value(expected, attribute, saved_groups)),
        }
    }
}

/// An array attribute is in `values` if any of its elements is.
fn is_in(attribute: &Value, values: &[Value]) -> bool {
    match attribute {
        Value::Array(items) => items
            .iter()
            .any(|item| values.iter().any(|v| json_equals(item, v))),
        attribute => values.iter().any(|v| json_equals(attribute, v)),
    }
}

/// Numbers compare numerically and strings lexically. Anything else is not comparable.
fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

fn version_operand(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Normalize a version so that lexical comparison matches semantic version ordering.
///
/// `v1.2.3+build` becomes `00001-00002-00003-~`. The trailing `~` sorts a release above any of
/// its pre-releases (`1.2.3-beta` becomes `00001-00002-00003-beta`).
pub(crate) fn padded_version_string(input: &str) -> String {
    let version = input.strip_prefix('v').unwrap_or(input);
    let version = version.split('+').next().unwrap_or_default();

    let mut parts: Vec<&str> = version.split(['.', '-']).filter(|p| !p.is_empty()).collect();
    if parts.len() == 3 {
        parts.push("~");
    }

    parts
        .into_iter()
        .map(|part| {
            if part.bytes().all(|b| b.is_ascii_digit()) {
                format!("{part:0>5}")
            } else {
                part.to_owned()
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}
