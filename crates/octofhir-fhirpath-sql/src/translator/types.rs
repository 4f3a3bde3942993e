//! FHIR type names and choice element discriminators.

/// Elements declared as `name[x]` in the base FHIR resources.
const CHOICE_ELEMENTS: &[&str] = &[
    "value",
    "effective",
    "onset",
    "abatement",
    "deceased",
    "multipleBirth",
    "occurrence",
    "performed",
    "born",
    "age",
    "medication",
    "timing",
    "serviced",
    "product",
    "asNeeded",
    "dose",
    "rate",
    "defaultValue",
    "fixed",
    "pattern",
    "minValue",
    "maxValue",
    "allowed",
    "used",
];

/// FHIR primitive types.
const PRIMITIVE_TYPES: &[&str] = &[
    "base64Binary",
    "boolean",
    "canonical",
    "code",
    "date",
    "dateTime",
    "decimal",
    "id",
    "instant",
    "integer",
    "integer64",
    "markdown",
    "oid",
    "positiveInt",
    "string",
    "time",
    "unsignedInt",
    "uri",
    "url",
    "uuid",
];

/// FHIR complex datatypes.
const COMPLEX_TYPES: &[&str] = &[
    "Address",
    "Age",
    "Annotation",
    "Attachment",
    "CodeableConcept",
    "CodeableReference",
    "Coding",
    "ContactDetail",
    "ContactPoint",
    "Count",
    "DataRequirement",
    "Distance",
    "Dosage",
    "Duration",
    "Expression",
    "Extension",
    "HumanName",
    "Identifier",
    "Meta",
    "Money",
    "Narrative",
    "ParameterDefinition",
    "Period",
    "Quantity",
    "Range",
    "Ratio",
    "RatioRange",
    "Reference",
    "RelatedArtifact",
    "SampledData",
    "Signature",
    "Timing",
    "TriggerDefinition",
    "UsageContext",
];

/// How a type test or cast is resolved against JSON.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TypeTarget {
    /// The element is a choice; read the typed field (`valueQuantity`).
    ChoiceField(String),
    /// A resource type, checked through its `resourceType` member.
    Resource(String),
    /// A datatype on an element that is not a choice.
    Datatype(String),
}

/// Strip `FHIR.` / `System.` qualifiers and surrounding backticks.
pub(crate) fn unqualified(type_name: &str) -> &str {
    let type_name = type_name.trim().trim_matches('`');
    type_name
        .strip_prefix("FHIR.")
        .or_else(|| type_name.strip_prefix("System."))
        .unwrap_or(type_name)
}

pub(crate) fn is_choice_element(name: &str) -> bool {
    CHOICE_ELEMENTS.contains(&name)
}

pub(crate) fn is_datatype(name: &str) -> bool {
    PRIMITIVE_TYPES.contains(&name)
        || COMPLEX_TYPES.contains(&name)
        || matches!(name, "String" | "Boolean" | "Integer" | "Decimal" | "Date" | "DateTime" | "Time")
}

/// Resolve `type_name` for an element whose last path component is `element`.
pub(crate) fn resolve(element: Option<&str>, type_name: &str) -> TypeTarget {
    let type_name = unqualified(type_name);
    if !is_datatype(type_name) && type_name.starts_with(|c: char| c.is_ascii_uppercase()) {
        return TypeTarget::Resource(type_name.to_string());
    }
    match element {
        Some(element) if is_choice_element(element) => {
            TypeTarget::ChoiceField(choice_field(element, type_name))
        }
        _ => TypeTarget::Datatype(type_name.to_string()),
    }
}

/// `value` + `dateTime` -> `valueDateTime`.
pub(crate) fn choice_field(element: &str, type_name: &str) -> String {
    let mut chars = type_name.chars();
    match chars.next() {
        Some(first) => format!("{element}{}{}", first.to_ascii_uppercase(), chars.as_str()),
        None => element.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_choice_field_names() {
        assert_eq!(choice_field("value", "Quantity"), "valueQuantity");
        assert_eq!(choice_field("effective", "dateTime"), "effectiveDateTime");
    }

    #[test]
    fn test_namespaces_are_stripped() {
        assert_eq!(unqualified("FHIR.Quantity"), "Quantity");
        assert_eq!(unqualified("System.String"), "String");
        assert_eq!(unqualified("`Patient`"), "Patient");
    }

    #[test]
    fn test_resolve_targets() {
        assert_eq!(
            resolve(Some("value"), "FHIR.Quantity"),
            TypeTarget::ChoiceField("valueQuantity".to_string())
        );
        assert_eq!(
            resolve(Some("resource"), "Patient"),
            TypeTarget::Resource("Patient".to_string())
        );
        assert_eq!(
            resolve(Some("name"), "HumanName"),
            TypeTarget::Datatype("HumanName".to_string())
        );
        assert_eq!(
            resolve(None, "Quantity"),
            TypeTarget::Datatype("Quantity".to_string())
        );
    }
}
