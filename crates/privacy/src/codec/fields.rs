//! The fixed set of profile attributes that are sealed at rest.

use common::Profile;

/// Profile columns holding personal data. `email`, `state` and `country`
/// stay in the clear for login lookups and reporting.
pub const SENSITIVE_FIELDS: [&str; 6] = [
    "full_name",
    "phone",
    "address_line_1",
    "address_line_2",
    "city",
    "zip_code",
];

/// Returns `true` if `column` is one of [`SENSITIVE_FIELDS`].
pub fn is_sensitive(column: &str) -> bool {
    SENSITIVE_FIELDS.contains(&column)
}

/// Mutable handles to the sensitive attributes of `profile`, paired with their
/// column names, in [`SENSITIVE_FIELDS`] order.
pub(crate) fn sensitive_fields_mut(profile: &mut Profile) -> [(&'static str, &mut Option<String>); 6] {
    [
        ("full_name", &mut profile.full_name),
        ("phone", &mut profile.phone),
        ("address_line_1", &mut profile.address_line_1),
        ("address_line_2", &mut profile.address_line_2),
        ("city", &mut profile.city),
        ("zip_code", &mut profile.zip_code),
    ]
}
