//! Merge raw scrapes into one canonical record per shop name.

use std::collections::{HashMap, HashSet};

use dsc_core::{CanonicalShopRecord, RawShopDocument};
use serde::Serialize;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Reconciled {
    pub records: Vec<CanonicalShopRecord>,
    /// Course entries discarded because an earlier entry had the same name.
    pub duplicate_courses: usize,
    /// Documents without a name; they cannot be grouped.
    pub nameless_documents: usize,
}

/// Group by exact `name` in first-seen order. The first document of a group is
/// the attribute template; course lists are unioned, keeping the earliest entry
/// per course name.
pub fn reconcile(documents: &[RawShopDocument]) -> Reconciled {
    let mut out = Reconciled::default();
    let mut group_index: HashMap<&str, usize> = HashMap::new();
    let mut seen_courses: Vec<HashSet<String>> = Vec::new();

    for doc in documents {
        let Some(name) = doc.name.as_deref() else {
            out.nameless_documents += 1;
            warn!(
                website = doc.website.as_deref().unwrap_or("-"),
                "skipping document without a shop name"
            );
            continue;
        };

        let idx = *group_index.entry(name).or_insert_with(|| {
            out.records.push(CanonicalShopRecord::from_template(name, doc));
            seen_courses.push(HashSet::new());
            out.records.len() - 1
        });

        let record = &mut out.records[idx];
        let seen = &mut seen_courses[idx];
        for course in &doc.course_list {
            if seen.insert(course.name.clone()) {
                record.course_list.push(course.clone());
            } else {
                out.duplicate_courses += 1;
                debug!(shop = %name, course = %course.name, "duplicate course discarded");
            }
        }
    }

    info!(
        documents = documents.len(),
        shops = out.records.len(),
        duplicate_courses = out.duplicate_courses,
        nameless = out.nameless_documents,
        "reconciled raw documents"
    );
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use dsc_core::CourseEntry;

    fn doc(name: &str, city: &str, courses: Vec<CourseEntry>) -> RawShopDocument {
        RawShopDocument {
            name: Some(name.to_string()),
            city: Some(city.to_string()),
            course_list: courses,
            ..Default::default()
        }
    }

    #[test]
    fn blue_ocean_duplicate_course_keeps_first_price() {
        let docs = vec![
            doc(
                "Blue Ocean Okinawa",
                "Naha",
                vec![CourseEntry::new("OWD", Some(39800), Some("beginner"))],
            ),
            doc(
                "Blue Ocean Okinawa",
                "Onna",
                vec![
                    CourseEntry::new("OWD", Some(41000), Some("beginner")),
                    CourseEntry::new("AOW", Some(49800), Some("intermediate")),
                ],
            ),
        ];

        let out = reconcile(&docs);
        assert_eq!(out.records.len(), 1);
        let record = &out.records[0];
        assert_eq!(record.city.as_deref(), Some("Naha"));
        assert_eq!(
            record.course_list,
            vec![
                CourseEntry::new("OWD", Some(39800), Some("beginner")),
                CourseEntry::new("AOW", Some(49800), Some("intermediate")),
            ]
        );
        assert_eq!(out.duplicate_courses, 1);
    }

    #[test]
    fn groups_keep_first_seen_order() {
        let docs = vec![
            doc("Manta", "Ishigaki", vec![]),
            doc("Reef", "Naha", vec![]),
            doc("Manta", "Miyako", vec![]),
            doc("Coral", "Kerama", vec![]),
        ];
        let names: Vec<_> = reconcile(&docs)
            .records
            .into_iter()
            .map(|r| r.name)
            .collect();
        assert_eq!(names, ["Manta", "Reef", "Coral"]);
    }

    #[test]
    fn reconciling_twice_concatenated_is_a_fixed_point() {
        let docs = vec![
            doc(
                "Reef",
                "Naha",
                vec![
                    CourseEntry::new("OWD", Some(1), None),
                    CourseEntry::new("OWD", Some(2), None),
                ],
            ),
            doc("Manta", "Ishigaki", vec![CourseEntry::new("Night", None, None)]),
            doc("Reef", "Onna", vec![CourseEntry::new("Deep", Some(3), None)]),
        ];
        let doubled: Vec<_> = docs.iter().chain(docs.iter()).cloned().collect();

        assert_eq!(reconcile(&doubled).records, reconcile(&docs).records);
    }

    #[test]
    fn course_names_are_unique_and_ordered_within_a_record() {
        let docs = vec![
            doc(
                "Reef",
                "Naha",
                vec![
                    CourseEntry::new("B", None, None),
                    CourseEntry::new("A", None, None),
                    CourseEntry::new("B", None, None),
                ],
            ),
            doc(
                "Reef",
                "Naha",
                vec![CourseEntry::new("C", None, None), CourseEntry::new("A", None, None)],
            ),
        ];
        let out = reconcile(&docs);
        let names: Vec<_> = out.records[0]
            .course_list
            .iter()
            .map(|c| c.name.as_str())
            .collect();
        assert_eq!(names, ["B", "A", "C"]);
        assert_eq!(out.duplicate_courses, 2);
    }

    #[test]
    fn malformed_course_lists_and_nameless_documents_do_not_fail_the_run() {
        let broken: RawShopDocument = serde_json::from_value(serde_json::json!({
            "name": "Reef",
            "course_list": {"unexpected": true}
        }))
        .expect("lenient");
        let nameless = RawShopDocument {
            course_list: vec![CourseEntry::new("OWD", None, None)],
            ..Default::default()
        };

        let out = reconcile(&[broken, nameless]);
        assert_eq!(out.records.len(), 1);
        assert!(out.records[0].course_list.is_empty());
        assert_eq!(out.nameless_documents, 1);
    }
}
