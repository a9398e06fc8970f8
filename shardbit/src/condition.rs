use crate::error::AppError;
use crate::transcode::Scalar;

/// One query predicate. Leaf variants target a property; `And`/`Or`/`Not`
/// group arbitrarily nested sub-conditions. Range-key predicates accept
/// only the scalar comparisons, `Between` and `BeginsWith`; filters accept
/// everything.
#[derive(Clone, Debug, PartialEq)]
pub enum Condition {
    Eq(String, Scalar),
    Ne(String, Scalar),
    Lt(String, Scalar),
    Le(String, Scalar),
    Gt(String, Scalar),
    Ge(String, Scalar),
    Between(String, Scalar, Scalar),
    BeginsWith(String, String),
    Contains(String, Scalar),
    Exists(String),
    NotExists(String),
    In(String, Vec<Scalar>),
    And(Vec<Condition>),
    Or(Vec<Condition>),
    Not(Box<Condition>),
}

impl Condition {
    /// True for the forms a range-key predicate may take.
    pub fn is_range_form(&self) -> bool {
        matches!(
            self,
            Condition::Eq(..)
                | Condition::Ne(..)
                | Condition::Lt(..)
                | Condition::Le(..)
                | Condition::Gt(..)
                | Condition::Ge(..)
                | Condition::Between(..)
                | Condition::BeginsWith(..)
        )
    }

    /// The property a leaf condition targets; `None` for groupings.
    pub fn property(&self) -> Option<&str> {
        match self {
            Condition::Eq(p, _)
            | Condition::Ne(p, _)
            | Condition::Lt(p, _)
            | Condition::Le(p, _)
            | Condition::Gt(p, _)
            | Condition::Ge(p, _)
            | Condition::Between(p, _, _)
            | Condition::BeginsWith(p, _)
            | Condition::Contains(p, _)
            | Condition::Exists(p)
            | Condition::NotExists(p)
            | Condition::In(p, _) => Some(p),
            Condition::And(_) | Condition::Or(_) | Condition::Not(_) => None,
        }
    }
}

/// Placeholder bindings accumulated while compiling conditions. Property
/// names share one placeholder; every literal gets a fresh one so repeated
/// conditions on the same property never collide.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Bindings {
    /// Placeholder -> property name.
    pub names: Vec<(String, String)>,
    /// Placeholder -> bound literal.
    pub values: Vec<(String, Scalar)>,
}

impl Bindings {
    pub fn bind_name(&mut self, prop: &str) -> String {
        if let Some((placeholder, _)) = self.names.iter().find(|(_, p)| p == prop) {
            return placeholder.clone();
        }
        let placeholder = format!("#n{}", self.names.len());
        self.names.push((placeholder.clone(), prop.to_string()));
        placeholder
    }

    pub fn bind_value(&mut self, value: &Scalar) -> String {
        let placeholder = format!(":v{}", self.values.len());
        self.values.push((placeholder.clone(), value.clone()));
        placeholder
    }
}

/// Compiles a condition tree into one predicate fragment, binding every
/// literal through `bindings`. Recursive descent; groupings emit their
/// children joined by the matching connective.
pub fn compile(cond: &Condition, bindings: &mut Bindings) -> Result<String, AppError> {
    match cond {
        Condition::Eq(p, v) => Ok(scalar_cmp(bindings, p, "=", v)),
        Condition::Ne(p, v) => Ok(scalar_cmp(bindings, p, "<>", v)),
        Condition::Lt(p, v) => Ok(scalar_cmp(bindings, p, "<", v)),
        Condition::Le(p, v) => Ok(scalar_cmp(bindings, p, "<=", v)),
        Condition::Gt(p, v) => Ok(scalar_cmp(bindings, p, ">", v)),
        Condition::Ge(p, v) => Ok(scalar_cmp(bindings, p, ">=", v)),
        Condition::Between(p, lo, hi) => {
            let n = bindings.bind_name(p);
            let lo = bindings.bind_value(lo);
            let hi = bindings.bind_value(hi);
            Ok(format!("{} BETWEEN {} AND {}", n, lo, hi))
        }
        Condition::BeginsWith(p, prefix) => {
            let n = bindings.bind_name(p);
            let v = bindings.bind_value(&Scalar::String(prefix.clone()));
            Ok(format!("begins_with({}, {})", n, v))
        }
        Condition::Contains(p, v) => {
            let n = bindings.bind_name(p);
            let v = bindings.bind_value(v);
            Ok(format!("contains({}, {})", n, v))
        }
        Condition::Exists(p) => Ok(format!("attribute_exists({})", bindings.bind_name(p))),
        Condition::NotExists(p) => Ok(format!("attribute_not_exists({})", bindings.bind_name(p))),
        Condition::In(p, options) => {
            if options.is_empty() {
                return Err(AppError::InvalidCondition(format!("IN on '{}' needs at least one option", p)));
            }
            let n = bindings.bind_name(p);
            let bound: Vec<String> = options.iter().map(|v| bindings.bind_value(v)).collect();
            Ok(format!("{} IN ({})", n, bound.join(", ")))
        }
        Condition::And(children) => compile_group(children, " AND ", bindings),
        Condition::Or(children) => compile_group(children, " OR ", bindings),
        Condition::Not(inner) => Ok(format!("NOT ({})", compile(inner, bindings)?)),
    }
}

fn scalar_cmp(bindings: &mut Bindings, prop: &str, op: &str, value: &Scalar) -> String {
    let n = bindings.bind_name(prop);
    let v = bindings.bind_value(value);
    format!("{} {} {}", n, op, v)
}

fn compile_group(
    children: &[Condition],
    connective: &str,
    bindings: &mut Bindings,
) -> Result<String, AppError> {
    if children.is_empty() {
        return Err(AppError::InvalidCondition("empty condition group".to_string()));
    }
    let fragments = children.iter().map(|c| compile(c, bindings)).collect::<Result<Vec<_>, _>>()?;
    Ok(format!("({})", fragments.join(connective)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(v: &str) -> Scalar {
        Scalar::String(v.to_string())
    }

    #[test]
    fn comparisons_compile_with_placeholders() {
        let mut b = Bindings::default();
        let frag = compile(&Condition::Le("total".to_string(), Scalar::Int(100)), &mut b).unwrap();
        assert_eq!(frag, "#n0 <= :v0");
        assert_eq!(b.names, vec![("#n0".to_string(), "total".to_string())]);
        assert_eq!(b.values, vec![(":v0".to_string(), Scalar::Int(100))]);
    }

    #[test]
    fn repeated_conditions_share_names_but_not_values() {
        let mut b = Bindings::default();
        let lo = compile(&Condition::Ge("total".to_string(), Scalar::Int(10)), &mut b).unwrap();
        let hi = compile(&Condition::Lt("total".to_string(), Scalar::Int(90)), &mut b).unwrap();
        assert_eq!(lo, "#n0 >= :v0");
        assert_eq!(hi, "#n0 < :v1", "same property, fresh literal placeholder");
        assert_eq!(b.values.len(), 2);
    }

    #[test]
    fn between_and_begins_with() {
        let mut b = Bindings::default();
        let frag = compile(
            &Condition::Between("created".to_string(), Scalar::Timestamp(1), Scalar::Timestamp(9)),
            &mut b,
        )
        .unwrap();
        assert_eq!(frag, "#n0 BETWEEN :v0 AND :v1");
        let frag = compile(&Condition::BeginsWith("sku".to_string(), "book-".to_string()), &mut b).unwrap();
        assert_eq!(frag, "begins_with(#n1, :v2)");
    }

    #[test]
    fn functions_and_membership() {
        let mut b = Bindings::default();
        assert_eq!(
            compile(&Condition::Contains("tags".to_string(), s("sale")), &mut b).unwrap(),
            "contains(#n0, :v0)"
        );
        assert_eq!(compile(&Condition::Exists("note".to_string()), &mut b).unwrap(), "attribute_exists(#n1)");
        assert_eq!(
            compile(&Condition::NotExists("deleted".to_string()), &mut b).unwrap(),
            "attribute_not_exists(#n2)"
        );
        assert_eq!(
            compile(&Condition::In("state".to_string(), vec![s("open"), s("held")]), &mut b).unwrap(),
            "#n3 IN (:v1, :v2)"
        );
    }

    #[test]
    fn nested_groupings_compile_recursively() {
        let mut b = Bindings::default();
        let cond = Condition::And(vec![
            Condition::Eq("state".to_string(), s("open")),
            Condition::Not(Box::new(Condition::Or(vec![
                Condition::Lt("total".to_string(), Scalar::Int(5)),
                Condition::Contains("tags".to_string(), s("test")),
            ]))),
        ]);
        let frag = compile(&cond, &mut b).unwrap();
        assert_eq!(frag, "(#n0 = :v0 AND NOT ((#n1 < :v1 OR contains(#n2, :v2))))");
    }

    #[test]
    fn empty_groups_and_empty_in_are_invalid() {
        let mut b = Bindings::default();
        assert!(compile(&Condition::And(vec![]), &mut b).is_err());
        assert!(compile(&Condition::Or(vec![]), &mut b).is_err());
        assert!(compile(&Condition::In("x".to_string(), vec![]), &mut b).is_err());
    }

    #[test]
    fn range_forms_are_classified() {
        assert!(Condition::Eq("a".to_string(), s("1")).is_range_form());
        assert!(Condition::Between("a".to_string(), s("1"), s("2")).is_range_form());
        assert!(Condition::BeginsWith("a".to_string(), "p".to_string()).is_range_form());
        assert!(!Condition::Contains("a".to_string(), s("1")).is_range_form());
        assert!(!Condition::And(vec![]).is_range_form());
        assert_eq!(Condition::Exists("a".to_string()).property(), Some("a"));
        assert_eq!(Condition::Not(Box::new(Condition::Exists("a".to_string()))).property(), None);
    }
}
