//! # Medical Vocabulary Module
//!
//! Controlled vocabulary used by the parser and the validator:
//!
//! - Canonical diagnosis names with their aliases and abbreviations
//! - Abbreviation expansions for diagnosis and treatment cells (HTA → Hypertension)
//! - Known treatment names, used to tell treatment cells from diagnosis cells
//! - Gender synonyms (H, Homme → M)
//! - Register header keywords mapped to columns

use crate::config::Column;
use crate::model::Gender;
use crate::similarity::{find_best_match, normalize_text};
use lazy_static::lazy_static;
use std::collections::HashMap;
use tracing::trace;

/// A diagnosis of the controlled vocabulary
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalDiagnosis {
    pub name: String,
    /// Lowercase alternative spellings and abbreviations
    pub aliases: Vec<String>,
    /// Set when the diagnosis only applies to one gender
    pub gender_restriction: Option<Gender>,
}

/// How a diagnosis text was matched against the vocabulary
#[derive(Debug, Clone, PartialEq)]
pub enum DiagnosisMatch {
    Exact(String),
    Fuzzy { name: String, distance: usize },
    NoMatch,
}

lazy_static! {
    static ref BUILTIN_DIAGNOSES: Vec<(&'static str, &'static [&'static str], Option<Gender>)> = vec![
        ("Paludisme", &["palu", "malaria", "paludisme simple"][..], None),
        ("Hypertension", &["hta", "hypertension artérielle", "hypertension arterielle"][..], None),
        ("Diarrhée", &["diarrhee", "diarrhea", "diarrhoea"][..], None),
        ("Diabète", &["diabete", "diabetes", "dt2", "did"][..], None),
        ("Infection respiratoire aiguë", &["ira", "ari", "infection respiratoire aigue"][..], None),
        ("Gastrite", &["gastritis"][..], None),
        ("Pneumonie", &["pneumonia"][..], None),
        ("Malnutrition", &["mas", "mam", "malnutrition aiguë"][..], None),
        ("Anémie", &["anemie", "anemia"][..], None),
        ("Tuberculose", &["tb", "tbc", "tuberculosis"][..], None),
        ("Infection urinaire", &["iu", "uti"][..], None),
        ("Fièvre typhoïde", &["typhoide", "typhoïde", "typhoid"][..], None),
        ("Rougeole", &["measles"][..], None),
        ("Dermatose", &["dermatite", "dermatitis"][..], None),
        ("Consultation prénatale", &["cpn", "anc", "consultation prenatale"][..], Some(Gender::F)),
    ];

    static ref BUILTIN_TREATMENT_ABBREVIATIONS: Vec<(&'static str, &'static str)> = vec![
        ("al", "Artemether-Lumefantrine"),
        ("asaq", "Artésunate-Amodiaquine"),
        ("sro", "Sels de réhydratation orale"),
        ("amox", "Amoxicilline"),
        ("pcm", "Paracétamol"),
        ("ctm", "Cotrimoxazole"),
        ("mtf", "Metformine"),
        ("omep", "Oméprazole"),
        ("ibu", "Ibuprofène"),
    ];

    static ref BUILTIN_TREATMENTS: Vec<&'static str> = vec![
        "Artemether-Lumefantrine",
        "Artésunate",
        "Artésunate-Amodiaquine",
        "Quinine",
        "Amlodipine",
        "Enalapril",
        "Hydrochlorothiazide",
        "Metformine",
        "Glibenclamide",
        "Insuline",
        "Amoxicilline",
        "Cotrimoxazole",
        "Ceftriaxone",
        "Oméprazole",
        "Paracétamol",
        "Ibuprofène",
        "Sels de réhydratation orale",
        "Zinc",
        "Fer",
        "Acide folique",
    ];

    static ref BUILTIN_GENDER_SYNONYMS: Vec<(&'static str, Gender)> = vec![
        ("m", Gender::M),
        ("h", Gender::M),
        ("g", Gender::M),
        ("homme", Gender::M),
        ("masculin", Gender::M),
        ("male", Gender::M),
        ("garçon", Gender::M),
        ("garcon", Gender::M),
        ("f", Gender::F),
        ("w", Gender::F),
        ("femme", Gender::F),
        ("féminin", Gender::F),
        ("feminin", Gender::F),
        ("female", Gender::F),
        ("fille", Gender::F),
    ];

    static ref HEADER_KEYWORDS: HashMap<&'static str, Column> = {
        let mut m = HashMap::new();
        for key in ["n°", "no", "n", "num", "numéro", "numero", "id", "identifiant", "patient"] {
            m.insert(key, Column::Id);
        }
        for key in ["âge", "age", "ans"] {
            m.insert(key, Column::Age);
        }
        for key in ["sexe", "genre", "sex", "gender"] {
            m.insert(key, Column::Gender);
        }
        for key in ["diagnostic", "diagnosis", "motif", "pathologie"] {
            m.insert(key, Column::Diagnosis);
        }
        for key in ["traitement", "treatment", "prescription", "conduite à tenir", "cat"] {
            m.insert(key, Column::Treatment);
        }
        for key in ["date", "jour"] {
            m.insert(key, Column::Date);
        }
        m
    };
}

/// Dictionary of canonical diagnoses, abbreviations, treatments and gender synonyms
#[derive(Debug, Clone)]
pub struct MedicalVocabulary {
    diagnoses: Vec<CanonicalDiagnosis>,
    abbreviations: HashMap<String, String>,
    treatments: Vec<String>,
    gender_synonyms: HashMap<String, Gender>,
}

impl Default for MedicalVocabulary {
    fn default() -> Self {
        Self::builtin()
    }
}

impl MedicalVocabulary {
    /// Vocabulary for West African primary-care registers (French with English aliases)
    pub fn builtin() -> Self {
        let mut vocabulary = Self::empty();

        for (name, aliases, restriction) in BUILTIN_DIAGNOSES.iter() {
            vocabulary.add_diagnosis(name, aliases.iter().copied(), *restriction);
        }
        for (abbreviation, expansion) in BUILTIN_TREATMENT_ABBREVIATIONS.iter() {
            vocabulary.add_abbreviation(abbreviation, expansion);
        }
        vocabulary
            .treatments
            .extend(BUILTIN_TREATMENTS.iter().map(|t| t.to_string()));
        for (synonym, gender) in BUILTIN_GENDER_SYNONYMS.iter() {
            vocabulary.add_gender_synonym(synonym, *gender);
        }

        vocabulary
    }

    /// Vocabulary without any entry, for registers with their own coding scheme
    pub fn empty() -> Self {
        Self {
            diagnoses: Vec::new(),
            abbreviations: HashMap::new(),
            treatments: Vec::new(),
            gender_synonyms: HashMap::new(),
        }
    }

    /// Register a canonical diagnosis.
    ///
    /// Short aliases (up to four characters, e.g. "HTA") also become abbreviations
    /// expanded by the parser.
    pub fn add_diagnosis<'a>(
        &mut self,
        name: &str,
        aliases: impl IntoIterator<Item = &'a str>,
        gender_restriction: Option<Gender>,
    ) {
        let aliases: Vec<String> = aliases.into_iter().map(|a| a.to_lowercase()).collect();
        for alias in &aliases {
            if alias.chars().count() <= 4 {
                self.abbreviations.insert(alias.clone(), name.to_string());
            }
        }
        self.diagnoses.push(CanonicalDiagnosis {
            name: name.to_string(),
            aliases,
            gender_restriction,
        });
    }

    pub fn add_abbreviation(&mut self, abbreviation: &str, expansion: &str) {
        self.abbreviations
            .insert(abbreviation.to_lowercase(), expansion.to_string());
    }

    pub fn add_treatment(&mut self, name: &str) {
        self.treatments.push(name.to_string());
    }

    pub fn add_gender_synonym(&mut self, synonym: &str, gender: Gender) {
        self.gender_synonyms.insert(synonym.to_lowercase(), gender);
    }

    pub fn diagnoses(&self) -> &[CanonicalDiagnosis] {
        &self.diagnoses
    }

    /// Expand abbreviations word by word, keeping punctuation such as `+`.
    ///
    /// A cell that is exactly an abbreviation is replaced as a whole.
    pub fn expand_abbreviations(&self, text: &str) -> String {
        let trimmed = text.trim();
        if let Some(expansion) = self.abbreviations.get(&trimmed.to_lowercase()) {
            trace!(from = %trimmed, to = %expansion, "Expanded abbreviation");
            return expansion.clone();
        }

        trimmed
            .split_whitespace()
            .map(|word| {
                let key = word
                    .trim_matches(|c: char| !c.is_alphanumeric())
                    .to_lowercase();
                match self.abbreviations.get(&key) {
                    Some(expansion) if !key.is_empty() => expansion.clone(),
                    _ => word.to_string(),
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Exact, case-insensitive lookup over canonical names and aliases
    pub fn exact_diagnosis(&self, text: &str) -> Option<&CanonicalDiagnosis> {
        let key = normalize_text(text);
        if key.is_empty() {
            return None;
        }
        self.diagnoses.iter().find(|d| {
            normalize_text(&d.name) == key || d.aliases.iter().any(|a| normalize_text(a) == key)
        })
    }

    /// Exact match first, then the closest name or alias within `max_distance`
    pub fn match_diagnosis(
        &self,
        text: &str,
        max_distance: usize,
        min_fuzzy_length: usize,
    ) -> DiagnosisMatch {
        if let Some(diagnosis) = self.exact_diagnosis(text) {
            return DiagnosisMatch::Exact(diagnosis.name.clone());
        }

        let key = normalize_text(text);
        if key.chars().count() < min_fuzzy_length || max_distance == 0 {
            return DiagnosisMatch::NoMatch;
        }

        // Compare against normalized spellings, then map back to the canonical name
        let mut spellings: Vec<(String, &str)> = Vec::new();
        for diagnosis in &self.diagnoses {
            spellings.push((normalize_text(&diagnosis.name), diagnosis.name.as_str()));
            for alias in &diagnosis.aliases {
                if alias.chars().count() >= min_fuzzy_length {
                    spellings.push((normalize_text(alias), diagnosis.name.as_str()));
                }
            }
        }

        let best = find_best_match(&key, spellings.iter().map(|(s, _)| s.as_str()), max_distance);
        match best {
            Some((spelling, distance)) => {
                let name = spellings
                    .iter()
                    .find(|(s, _)| s == spelling)
                    .map(|(_, name)| name.to_string())
                    .unwrap_or_default();
                DiagnosisMatch::Fuzzy { name, distance }
            }
            None => DiagnosisMatch::NoMatch,
        }
    }

    /// Gender restriction of a canonical diagnosis
    pub fn gender_restriction(&self, canonical_name: &str) -> Option<Gender> {
        self.diagnoses
            .iter()
            .find(|d| d.name == canonical_name)
            .and_then(|d| d.gender_restriction)
    }

    /// Whether the text names a known treatment (after abbreviation expansion)
    pub fn is_known_treatment(&self, text: &str) -> bool {
        let expanded = normalize_text(&self.expand_abbreviations(text));
        if expanded.is_empty() {
            return false;
        }
        self.treatments.iter().any(|t| {
            let known = normalize_text(t);
            expanded == known || expanded.starts_with(&format!("{} ", known))
        })
    }

    /// Gender for a synonym such as "H", "Homme" or "Female"
    pub fn gender_for(&self, text: &str) -> Option<Gender> {
        let key = text
            .trim()
            .trim_end_matches('.')
            .to_lowercase();
        self.gender_synonyms.get(&key).copied()
    }

    /// Column named by a header cell, if any
    pub fn header_column(&self, text: &str) -> Option<Column> {
        let key = text
            .trim()
            .trim_end_matches([':', '.'])
            .trim()
            .to_lowercase();
        HEADER_KEYWORDS.get(key.as_str()).copied()
    }
}
