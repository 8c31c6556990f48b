use crate::error::{CatalogError, Result};
use crate::util::fold_key;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    Brand,
    Code,
    Description,
    Group,
    Application,
    Vehicles,
    Details,
    Oem,
    Similar,
}

/// Accepted header labels per field, compared after `fold_key`.
pub const HEADER_ALIASES: &[(Field, &[&str])] = &[
    (Field::Brand, &["FABRICANTE", "MARCA"]),
    (Field::Code, &["CODIGO", "COD", "REFERENCIA", "REF"]),
    (Field::Description, &["DESCRICAO", "DESCRICAO DO PRODUTO"]),
    (Field::Group, &["GRUPO", "GRUPO DE PRODUTOS", "CATEGORIA"]),
    (Field::Application, &["APLICACAO", "APLICACOES"]),
    (Field::Vehicles, &["VEICULOS", "VEICULO", "MODELOS"]),
    (Field::Oem, &["OEM"]),
    (Field::Similar, &["SIMILAR", "SIMILARES"]),
];

/// Fragments that mark a free-form notes column.
const DETAILS_MARKERS: &[&str] = &["DETAL", "OBSERV", "NOTA"];

/// Column position of every field the sheet carries.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ColumnMap {
    pub brand: Option<usize>,
    pub code: usize,
    pub description: usize,
    pub group: Option<usize>,
    pub application: Option<usize>,
    pub vehicles: Option<usize>,
    pub details: Option<usize>,
    pub oem: Option<usize>,
    pub similar: Option<usize>,
}

pub fn field_for_header(header: &str) -> Option<Field> {
    let key = fold_key(header);
    if key.is_empty() {
        return None;
    }

    let aliased = HEADER_ALIASES
        .iter()
        .find(|(_, aliases)| aliases.contains(&key.as_str()))
        .map(|(field, _)| *field);
    if aliased.is_some() {
        return aliased;
    }

    if key == "OBS" || DETAILS_MARKERS.iter().any(|marker| key.contains(marker)) {
        return Some(Field::Details);
    }
    None
}

/// Resolves the header row once per import. When a field appears twice the
/// leftmost column wins.
pub fn resolve_columns<S: AsRef<str>>(headers: &[S]) -> Result<ColumnMap> {
    let mut found: [Option<usize>; 9] = [None; 9];

    for (position, header) in headers.iter().enumerate() {
        let Some(field) = field_for_header(header.as_ref()) else {
            continue;
        };
        let slot = &mut found[slot_of(field)];
        if slot.is_none() {
            *slot = Some(position);
        }
    }

    let code = found[slot_of(Field::Code)]
        .ok_or_else(|| CatalogError::SpreadsheetInvalid("missing code column".to_string()))?;
    let description = found[slot_of(Field::Description)].ok_or_else(|| {
        CatalogError::SpreadsheetInvalid("missing description column".to_string())
    })?;

    Ok(ColumnMap {
        brand: found[slot_of(Field::Brand)],
        code,
        description,
        group: found[slot_of(Field::Group)],
        application: found[slot_of(Field::Application)],
        vehicles: found[slot_of(Field::Vehicles)],
        details: found[slot_of(Field::Details)],
        oem: found[slot_of(Field::Oem)],
        similar: found[slot_of(Field::Similar)],
    })
}

fn slot_of(field: Field) -> usize {
    match field {
        Field::Brand => 0,
        Field::Code => 1,
        Field::Description => 2,
        Field::Group => 3,
        Field::Application => 4,
        Field::Vehicles => 5,
        Field::Details => 6,
        Field::Oem => 7,
        Field::Similar => 8,
    }
}
