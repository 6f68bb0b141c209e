use crate::messages::ProtocolError;

/// Flat string field pairs, the shape a stream broker stores per entry.
pub type FieldMap = Vec<(String, String)>;

pub fn field<'a>(fields: &'a [(String, String)], name: &str) -> Option<&'a str> {
    fields
        .iter()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.as_str())
}

pub fn require_field<'a>(
    fields: &'a [(String, String)],
    name: &str,
) -> Result<&'a str, ProtocolError> {
    field(fields, name).ok_or_else(|| ProtocolError::MissingField(name.to_string()))
}
