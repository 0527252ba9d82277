use serde::{Deserialize, Serialize};

/// An RDF term as it appears in a solution binding.
///
/// Equality follows the SPARQL results model: IRIs compare by string, literals
/// by lexical form plus datatype plus language tag, blank nodes by their
/// scoped label.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RdfTerm {
    Iri(String),
    Literal { lexical: String, datatype: Option<String>, lang: Option<String> },
    BNode(String),
}

impl RdfTerm {
    pub fn iri(value: impl Into<String>) -> Self { Self::Iri(value.into()) }

    /// A plain literal with neither datatype nor language tag.
    pub fn literal(lexical: impl Into<String>) -> Self { Self::Literal { lexical: lexical.into(), datatype: None, lang: None } }

    pub fn typed_literal(lexical: impl Into<String>, datatype: impl Into<String>) -> Self {
        Self::Literal { lexical: lexical.into(), datatype: Some(datatype.into()), lang: None }
    }

    pub fn lang_literal(lexical: impl Into<String>, lang: impl Into<String>) -> Self {
        Self::Literal { lexical: lexical.into(), datatype: None, lang: Some(lang.into()) }
    }

    pub fn bnode(label: impl Into<String>) -> Self { Self::BNode(label.into()) }

    /// The term's value as written, without type annotations.
    pub fn value(&self) -> &str {
        match self {
            Self::Iri(v) => v,
            Self::Literal { lexical, .. } => lexical,
            Self::BNode(label) => label,
        }
    }
}

// Wire shape per the SPARQL 1.1 Query Results JSON format:
// {"type": "uri" | "literal" | "bnode", "value": ..., "datatype"?, "xml:lang"?}
#[derive(Serialize, Deserialize)]
struct TermRepr {
    #[serde(rename = "type")]
    kind: String,
    value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    datatype: Option<String>,
    #[serde(rename = "xml:lang", skip_serializing_if = "Option::is_none")]
    lang: Option<String>,
}

impl Serialize for RdfTerm {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where S: serde::Serializer {
        let repr = match self {
            Self::Iri(value) => TermRepr { kind: "uri".into(), value: value.clone(), datatype: None, lang: None },
            Self::Literal { lexical, datatype, lang } => {
                TermRepr { kind: "literal".into(), value: lexical.clone(), datatype: datatype.clone(), lang: lang.clone() }
            }
            Self::BNode(label) => TermRepr { kind: "bnode".into(), value: label.clone(), datatype: None, lang: None },
        };
        repr.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for RdfTerm {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where D: serde::Deserializer<'de> {
        let repr = TermRepr::deserialize(deserializer)?;
        match repr.kind.as_str() {
            "uri" => Ok(Self::Iri(repr.value)),
            "literal" => Ok(Self::Literal { lexical: repr.value, datatype: repr.datatype, lang: repr.lang }),
            "bnode" => Ok(Self::BNode(repr.value)),
            other => Err(serde::de::Error::custom(format!("unknown term type: {other}"))),
        }
    }
}
