use crate::error::{ReconcileError, Result};
use crate::schema::{
    Category, CounterpartyKey, DeclarationKey, DeclarationType, LineRecord, ParsedBundle,
    Periodicity,
};
use crate::utils::parse_exchange_amount;
use log::debug;
use quick_xml::events::Event;
use quick_xml::Reader;

/// Which table of a declaration form a line sits in. The exchange format
/// does not label tables; the kind is recognized from the field ids the
/// line carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TableKind {
    /// Goods table of a goods declaration, or the services table of a
    /// services declaration (both use the same field ids).
    Primary,
    /// Triangular-operations table of a goods declaration.
    Triangular,
    /// Corrections table referencing an earlier filed period.
    Correction,
}

/// Semantic role of a tagged field within a given table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FieldRole {
    CounterpartyCountry,
    CounterpartyVat,
    Amount,
    TargetYear,
    /// The id of the target-period field also encodes the cadence of the
    /// corrected declaration.
    TargetPeriod(Periodicity),
    /// Marks a goods-family correction as triangular when non-empty.
    CategoryFlag,
}

fn table_kind(fields: &[(String, String)]) -> Option<TableKind> {
    let has = |id: &str| fields.iter().any(|(i, _)| i == id);
    if has("11") || has("14") {
        Some(TableKind::Correction)
    } else if has("07") {
        Some(TableKind::Triangular)
    } else if has("03") {
        Some(TableKind::Primary)
    } else {
        None
    }
}

fn field_role(kind: TableKind, id: &str) -> Option<FieldRole> {
    match (kind, id) {
        (TableKind::Primary, "01") => Some(FieldRole::CounterpartyCountry),
        (TableKind::Primary, "02") => Some(FieldRole::CounterpartyVat),
        (TableKind::Primary, "03") => Some(FieldRole::Amount),
        (TableKind::Triangular, "05") => Some(FieldRole::CounterpartyCountry),
        (TableKind::Triangular, "06") => Some(FieldRole::CounterpartyVat),
        (TableKind::Triangular, "07") => Some(FieldRole::Amount),
        (TableKind::Correction, "09") => Some(FieldRole::CounterpartyCountry),
        (TableKind::Correction, "10") => Some(FieldRole::CounterpartyVat),
        (TableKind::Correction, "11") => Some(FieldRole::TargetYear),
        (TableKind::Correction, "12") => Some(FieldRole::TargetPeriod(Periodicity::Quarterly)),
        (TableKind::Correction, "18") => Some(FieldRole::TargetPeriod(Periodicity::Monthly)),
        (TableKind::Correction, "14") => Some(FieldRole::Amount),
        (TableKind::Correction, "15") => Some(FieldRole::CategoryFlag),
        _ => None,
    }
}

fn malformed(file: &str, reason: impl Into<String>) -> ReconcileError {
    ReconcileError::MalformedDocument {
        file: file.to_string(),
        reason: reason.into(),
    }
}

/// A declaration block currently being read, belonging to the filing entity
/// and of a recognized recapitulative type.
struct PendingDeclaration {
    declaration_type: DeclarationType,
    year: Option<i32>,
    period: Option<u32>,
}

impl PendingDeclaration {
    fn own_key(&self, file: &str) -> Result<DeclarationKey> {
        let year = self
            .year
            .ok_or_else(|| malformed(file, "declaration is missing its Year"))?;
        let period = self
            .period
            .ok_or_else(|| malformed(file, "declaration is missing its Period"))?;
        DeclarationKey::new(self.declaration_type, year, period)
            .map_err(|e| malformed(file, e.to_string()))
    }
}

/// Resolves one table line into the key it applies to and its line record.
///
/// A line carrying a back-reference year corrects the period named by its
/// back-reference fields; any other line is an original amount for the
/// enclosing declaration.
fn resolve_line(
    file: &str,
    declaration: &PendingDeclaration,
    fields: &[(String, String)],
) -> Result<(DeclarationKey, LineRecord)> {
    let kind = table_kind(fields)
        .ok_or_else(|| malformed(file, "table line carries no recognized amount field"))?;

    let mut country: Option<&str> = None;
    let mut vat: Option<&str> = None;
    let mut amount_text: Option<&str> = None;
    let mut target_year: Option<&str> = None;
    let mut target_period: Option<(Periodicity, &str)> = None;
    let mut category_flag = false;

    for (id, text) in fields {
        match field_role(kind, id) {
            Some(FieldRole::CounterpartyCountry) => country = Some(text),
            Some(FieldRole::CounterpartyVat) => vat = Some(text),
            Some(FieldRole::Amount) => amount_text = Some(text),
            Some(FieldRole::TargetYear) => target_year = Some(text),
            Some(FieldRole::TargetPeriod(p)) => target_period = Some((p, text)),
            Some(FieldRole::CategoryFlag) => category_flag = !text.trim().is_empty(),
            None => {}
        }
    }

    let country =
        country.ok_or_else(|| malformed(file, "table line is missing its country field"))?;
    let vat = vat.ok_or_else(|| malformed(file, "table line is missing its VAT field"))?;
    let amount_text =
        amount_text.ok_or_else(|| malformed(file, "table line is missing its amount field"))?;
    let amount = parse_exchange_amount(amount_text)
        .ok_or_else(|| malformed(file, format!("unparsable amount: {amount_text:?}")))?;
    let counterparty = CounterpartyKey::new(country, vat);

    if kind == TableKind::Correction {
        let year_text = target_year
            .ok_or_else(|| malformed(file, "correction line is missing its target year"))?;
        let (periodicity, period_text) = target_period
            .ok_or_else(|| malformed(file, "correction line is missing its target period"))?;
        let year: i32 = year_text
            .trim()
            .parse()
            .map_err(|_| malformed(file, format!("unparsable target year: {year_text:?}")))?;
        let period: u32 = period_text
            .trim()
            .parse()
            .map_err(|_| malformed(file, format!("unparsable target period: {period_text:?}")))?;

        let target_type = declaration.declaration_type.with_periodicity(periodicity);
        let target_key =
            DeclarationKey::new(target_type, year, period).map_err(|e| malformed(file, e.to_string()))?;

        let category = if declaration.declaration_type.is_services() {
            Category::Services
        } else if category_flag {
            Category::Triangular
        } else {
            Category::Goods
        };

        return Ok((
            target_key,
            LineRecord {
                category,
                counterparty,
                amount,
                corrective: true,
            },
        ));
    }

    let category = if declaration.declaration_type.is_services() {
        Category::Services
    } else if kind == TableKind::Triangular {
        Category::Triangular
    } else {
        Category::Goods
    };

    Ok((
        declaration.own_key(file)?,
        LineRecord {
            category,
            counterparty,
            amount,
            corrective: false,
        },
    ))
}

/// Decodes one historical declaration document into a [`ParsedBundle`].
///
/// Only declarer blocks whose registration number matches `filing_entity`
/// contribute, and within them only declarations of the recapitulative
/// statement types. Fails with [`ReconcileError::MalformedDocument`] on
/// structural problems and [`ReconcileError::NotADeclaration`] when the
/// document holds nothing for the filing entity; a failing document never
/// yields a partial bundle.
pub fn parse_document(
    file_name: &str,
    bytes: &[u8],
    filing_entity: &str,
) -> Result<ParsedBundle> {
    let mut reader = Reader::from_reader(bytes);
    reader.trim_text(true);

    let mut bundle = ParsedBundle::default();
    let entity = filing_entity.trim();

    let mut buf = Vec::new();

    let mut in_declarations = false;
    let mut in_declarer = false;
    let mut declarer_matr: Option<String> = None;
    let mut declaration: Option<PendingDeclaration> = None;

    // Text-capture targets inside an accepted declaration
    let mut in_matr = false;
    let mut in_year = false;
    let mut in_period = false;
    let mut text = String::new();

    // Fields of the table line currently being read
    let mut line_fields: Option<Vec<(String, String)>> = None;
    let mut field_id: Option<String> = None;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"Declarations" => in_declarations = true,
                b"Declarer" if in_declarations => {
                    in_declarer = true;
                    declarer_matr = None;
                }
                b"MatrNbr" if in_declarer && declaration.is_none() => {
                    in_matr = true;
                    text.clear();
                }
                b"Declaration" if in_declarer => {
                    let mut decl_type = None;
                    for a in e.attributes().flatten() {
                        if a.key.as_ref() == b"type" {
                            if let Ok(v) = String::from_utf8(a.value.into_owned()) {
                                decl_type = DeclarationType::from_code(v.trim());
                            }
                        }
                    }
                    // Declarations of other entities or of unrelated report
                    // types are skipped, not errors
                    if declarer_matr.as_deref() == Some(entity) {
                        if let Some(declaration_type) = decl_type {
                            declaration = Some(PendingDeclaration {
                                declaration_type,
                                year: None,
                                period: None,
                            });
                        }
                    }
                }
                b"Year" if declaration.is_some() && line_fields.is_none() => {
                    in_year = true;
                    text.clear();
                }
                b"Period" if declaration.is_some() && line_fields.is_none() => {
                    in_period = true;
                    text.clear();
                }
                b"Line" if declaration.is_some() => {
                    line_fields = Some(Vec::new());
                }
                b"TextField" | b"NumericField" if line_fields.is_some() => {
                    for a in e.attributes().flatten() {
                        if a.key.as_ref() == b"id" {
                            if let Ok(v) = String::from_utf8(a.value.into_owned()) {
                                field_id = Some(v);
                            }
                        }
                    }
                    text.clear();
                }
                _ => {}
            },
            Ok(Event::Empty(e)) => match e.local_name().as_ref() {
                // A self-closing field still marks presence, with empty text
                b"TextField" | b"NumericField" if line_fields.is_some() => {
                    for a in e.attributes().flatten() {
                        if a.key.as_ref() == b"id" {
                            if let Ok(v) = String::from_utf8(a.value.into_owned()) {
                                if let Some(fields) = line_fields.as_mut() {
                                    fields.push((v, String::new()));
                                }
                            }
                        }
                    }
                }
                _ => {}
            },
            Ok(Event::Text(t)) => {
                if in_matr || in_year || in_period || field_id.is_some() {
                    let unescaped = t
                        .unescape()
                        .map_err(|e| malformed(file_name, e.to_string()))?;
                    text.push_str(&unescaped);
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"Declarations" => in_declarations = false,
                b"Declarer" => {
                    in_declarer = false;
                    declarer_matr = None;
                }
                b"MatrNbr" if in_matr => {
                    in_matr = false;
                    if declarer_matr.is_none() {
                        declarer_matr = Some(text.trim().to_string());
                    }
                }
                b"Year" if in_year => {
                    in_year = false;
                    let year = text
                        .trim()
                        .parse()
                        .map_err(|_| malformed(file_name, format!("unparsable year: {:?}", text.trim())))?;
                    if let Some(d) = declaration.as_mut() {
                        d.year = Some(year);
                    }
                }
                b"Period" if in_period => {
                    in_period = false;
                    let period = text
                        .trim()
                        .parse()
                        .map_err(|_| malformed(file_name, format!("unparsable period: {:?}", text.trim())))?;
                    if let Some(d) = declaration.as_mut() {
                        d.period = Some(period);
                    }
                }
                b"TextField" | b"NumericField" => {
                    if let (Some(fields), Some(id)) = (line_fields.as_mut(), field_id.take()) {
                        fields.push((id, text.clone()));
                        text.clear();
                    }
                }
                b"Line" => {
                    if let (Some(fields), Some(decl)) = (line_fields.take(), declaration.as_ref())
                    {
                        let (key, record) = resolve_line(file_name, decl, &fields)?;
                        if record.corrective {
                            bundle.corrective_lines.push((key, record));
                        } else {
                            bundle.original_lines.push((key, record));
                        }
                    }
                }
                b"Declaration" => {
                    if let Some(decl) = declaration.take() {
                        // The declared period is remembered even when the
                        // declaration holds no lines at all
                        bundle.declared_keys.push(decl.own_key(file_name)?);
                    }
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(malformed(file_name, e.to_string())),
        }
        buf.clear();
    }

    if bundle.is_empty() {
        return Err(ReconcileError::NotADeclaration {
            file: file_name.to_string(),
        });
    }

    debug!(
        "{}: parsed {} declared period(s), {} original line(s), {} corrective line(s)",
        file_name,
        bundle.declared_keys.len(),
        bundle.original_lines.len(),
        bundle.corrective_lines.len()
    );

    Ok(bundle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    const ENTITY: &str = "1111111111111";

    fn wrap(declarers: &str) -> Vec<u8> {
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<eCDFDeclarations xmlns="http://www.ctie.etat.lu/2011/ecdf">
    <FileReference>000000XYZ123</FileReference>
    <eCDFFileVersion>2.0</eCDFFileVersion>
    <Interface>MODL5</Interface>
    <Agent>
        <MatrNbr>9999999999999</MatrNbr>
        <RCSNbr>NE</RCSNbr>
        <VATNbr>NE</VATNbr>
    </Agent>
    <Declarations>{declarers}</Declarations>
</eCDFDeclarations>"#
        )
        .into_bytes()
    }

    fn declarer(matr: &str, declarations: &str) -> String {
        format!(
            "<Declarer><MatrNbr>{matr}</MatrNbr><RCSNbr>NE</RCSNbr><VATNbr>NE</VATNbr>{declarations}</Declarer>"
        )
    }

    fn goods_declaration_2020_5() -> String {
        r#"<Declaration type="TVA_LICM" model="1" language="EN">
            <Year>2020</Year>
            <Period>5</Period>
            <FormData>
                <NumericField id="04">1,00</NumericField>
                <NumericField id="08">10,00</NumericField>
                <Table>
                    <Line num="1">
                        <TextField id="01">BE</TextField>
                        <TextField id="02">0477472701</TextField>
                        <NumericField id="03">1,00</NumericField>
                    </Line>
                </Table>
                <Table>
                    <Line num="1">
                        <TextField id="05">BE</TextField>
                        <TextField id="06">0477472701</TextField>
                        <NumericField id="07">10,00</NumericField>
                    </Line>
                </Table>
                <Table>
                    <Line num="1">
                        <TextField id="09">FR</TextField>
                        <TextField id="10">00000000190</TextField>
                        <NumericField id="11">2020</NumericField>
                        <NumericField id="18">4</NumericField>
                        <NumericField id="14">-2,50</NumericField>
                    </Line>
                    <Line num="2">
                        <TextField id="09">BE</TextField>
                        <TextField id="10">0477472701</TextField>
                        <NumericField id="11">2020</NumericField>
                        <NumericField id="18">4</NumericField>
                        <NumericField id="14">10,00</NumericField>
                        <TextField id="15">Yes</TextField>
                    </Line>
                </Table>
            </FormData>
        </Declaration>"#
            .to_string()
    }

    fn key(t: DeclarationType, year: i32, period: u32) -> DeclarationKey {
        DeclarationKey::new(t, year, period).unwrap()
    }

    #[test]
    fn test_parse_goods_declaration_with_corrections() {
        let doc = wrap(&declarer(ENTITY, &goods_declaration_2020_5()));
        let bundle = parse_document("decl.xml", &doc, ENTITY).unwrap();

        assert_eq!(
            bundle.declared_keys,
            vec![key(DeclarationType::GoodsMonthly, 2020, 5)]
        );

        assert_eq!(bundle.original_lines.len(), 2);
        let (k, rec) = &bundle.original_lines[0];
        assert_eq!(*k, key(DeclarationType::GoodsMonthly, 2020, 5));
        assert_eq!(rec.category, Category::Goods);
        assert_eq!(rec.counterparty, CounterpartyKey::new("BE", "0477472701"));
        assert_eq!(rec.amount, Decimal::new(100, 2));
        assert!(!rec.corrective);

        let (k, rec) = &bundle.original_lines[1];
        assert_eq!(*k, key(DeclarationType::GoodsMonthly, 2020, 5));
        assert_eq!(rec.category, Category::Triangular);
        assert_eq!(rec.amount, Decimal::new(1000, 2));

        assert_eq!(bundle.corrective_lines.len(), 2);
        let (k, rec) = &bundle.corrective_lines[0];
        assert_eq!(*k, key(DeclarationType::GoodsMonthly, 2020, 4));
        assert_eq!(rec.category, Category::Goods);
        assert_eq!(rec.counterparty, CounterpartyKey::new("FR", "00000000190"));
        assert_eq!(rec.amount, Decimal::new(-250, 2));
        assert!(rec.corrective);

        let (_, rec) = &bundle.corrective_lines[1];
        assert_eq!(rec.category, Category::Triangular);
    }

    #[test]
    fn test_services_declaration_lines_are_services() {
        let decl = r#"<Declaration type="TVA_PSIM" model="1" language="EN">
            <Year>2020</Year>
            <Period>5</Period>
            <FormData>
                <Table>
                    <Line num="1">
                        <TextField id="01">BE</TextField>
                        <TextField id="02">0477472701</TextField>
                        <NumericField id="03">100,00</NumericField>
                    </Line>
                </Table>
                <Table>
                    <Line num="1">
                        <TextField id="09">BE</TextField>
                        <TextField id="10">0477472701</TextField>
                        <NumericField id="11">2020</NumericField>
                        <NumericField id="18">4</NumericField>
                        <NumericField id="14">100,00</NumericField>
                    </Line>
                </Table>
            </FormData>
        </Declaration>"#;
        let doc = wrap(&declarer(ENTITY, decl));
        let bundle = parse_document("services.xml", &doc, ENTITY).unwrap();

        assert_eq!(
            bundle.declared_keys,
            vec![key(DeclarationType::ServicesMonthly, 2020, 5)]
        );
        assert_eq!(bundle.original_lines[0].1.category, Category::Services);
        let (target, rec) = &bundle.corrective_lines[0];
        assert_eq!(*target, key(DeclarationType::ServicesMonthly, 2020, 4));
        assert_eq!(rec.category, Category::Services);
    }

    #[test]
    fn test_quarterly_back_reference_field() {
        // Field id 12 instead of 18 retargets the correction at a
        // quarterly-filed period
        let decl = r#"<Declaration type="TVA_LICM" model="1" language="EN">
            <Year>2020</Year>
            <Period>7</Period>
            <FormData>
                <Table>
                    <Line num="1">
                        <TextField id="09">BE</TextField>
                        <TextField id="10">0477472701</TextField>
                        <NumericField id="11">2020</NumericField>
                        <NumericField id="12">1</NumericField>
                        <NumericField id="14">3,00</NumericField>
                    </Line>
                </Table>
            </FormData>
        </Declaration>"#;
        let doc = wrap(&declarer(ENTITY, decl));
        let bundle = parse_document("quarterly.xml", &doc, ENTITY).unwrap();

        let (target, _) = &bundle.corrective_lines[0];
        assert_eq!(*target, key(DeclarationType::GoodsQuarterly, 2020, 1));
    }

    #[test]
    fn test_declared_but_empty_declaration() {
        let decl = r#"<Declaration type="TVA_LICM" model="1" language="EN">
            <Year>2020</Year>
            <Period>3</Period>
            <FormData>
                <NumericField id="04">0,00</NumericField>
            </FormData>
        </Declaration>"#;
        let doc = wrap(&declarer(ENTITY, decl));
        let bundle = parse_document("empty.xml", &doc, ENTITY).unwrap();

        assert_eq!(
            bundle.declared_keys,
            vec![key(DeclarationType::GoodsMonthly, 2020, 3)]
        );
        assert!(bundle.original_lines.is_empty());
        assert!(bundle.corrective_lines.is_empty());
    }

    #[test]
    fn test_other_entity_is_not_a_declaration() {
        let doc = wrap(&declarer("2222222222222", &goods_declaration_2020_5()));
        let err = parse_document("other.xml", &doc, ENTITY).unwrap_err();
        assert!(matches!(
            err,
            ReconcileError::NotADeclaration { file } if file == "other.xml"
        ));
    }

    #[test]
    fn test_unrelated_declaration_type_is_skipped() {
        let decl = r#"<Declaration type="AN_BILAN" model="1" language="EN">
            <Year>2020</Year>
            <Period>1</Period>
            <FormData/>
        </Declaration>"#;
        let doc = wrap(&declarer(ENTITY, decl));
        let err = parse_document("bilan.xml", &doc, ENTITY).unwrap_err();
        assert!(matches!(err, ReconcileError::NotADeclaration { .. }));
    }

    #[test]
    fn test_not_xml_is_malformed() {
        let err = parse_document("junk.xml", b"<eCDF><Declarations></wrong>", ENTITY).unwrap_err();
        assert!(matches!(
            err,
            ReconcileError::MalformedDocument { file, .. } if file == "junk.xml"
        ));
    }

    #[test]
    fn test_missing_period_is_malformed() {
        let decl = r#"<Declaration type="TVA_LICM" model="1" language="EN">
            <Year>2020</Year>
            <FormData/>
        </Declaration>"#;
        let doc = wrap(&declarer(ENTITY, decl));
        let err = parse_document("noperiod.xml", &doc, ENTITY).unwrap_err();
        assert!(matches!(err, ReconcileError::MalformedDocument { .. }));
    }

    #[test]
    fn test_out_of_range_period_is_malformed() {
        let decl = r#"<Declaration type="TVA_LICM" model="1" language="EN">
            <Year>2020</Year>
            <Period>13</Period>
            <FormData/>
        </Declaration>"#;
        let doc = wrap(&declarer(ENTITY, decl));
        let err = parse_document("badperiod.xml", &doc, ENTITY).unwrap_err();
        assert!(matches!(err, ReconcileError::MalformedDocument { .. }));
    }

    #[test]
    fn test_unparsable_amount_is_malformed() {
        let decl = r#"<Declaration type="TVA_LICM" model="1" language="EN">
            <Year>2020</Year>
            <Period>5</Period>
            <FormData>
                <Table>
                    <Line num="1">
                        <TextField id="01">BE</TextField>
                        <TextField id="02">0477472701</TextField>
                        <NumericField id="03">one</NumericField>
                    </Line>
                </Table>
            </FormData>
        </Declaration>"#;
        let doc = wrap(&declarer(ENTITY, decl));
        let err = parse_document("badamount.xml", &doc, ENTITY).unwrap_err();
        assert!(matches!(err, ReconcileError::MalformedDocument { .. }));
    }

    #[test]
    fn test_two_declarers_filtering() {
        let declarers = format!(
            "{}{}",
            declarer("2222222222222", &goods_declaration_2020_5()),
            declarer(ENTITY, &goods_declaration_2020_5())
        );
        let doc = wrap(&declarers);
        let bundle = parse_document("two.xml", &doc, ENTITY).unwrap();
        // Only the matching declarer's declaration contributes
        assert_eq!(bundle.declared_keys.len(), 1);
        assert_eq!(bundle.original_lines.len(), 2);
    }

    #[test]
    fn test_empty_category_flag_stays_goods() {
        let decl = r#"<Declaration type="TVA_LICM" model="1" language="EN">
            <Year>2020</Year>
            <Period>5</Period>
            <FormData>
                <Table>
                    <Line num="1">
                        <TextField id="09">BE</TextField>
                        <TextField id="10">0477472701</TextField>
                        <NumericField id="11">2020</NumericField>
                        <NumericField id="18">4</NumericField>
                        <NumericField id="14">1,00</NumericField>
                        <TextField id="15"/>
                    </Line>
                </Table>
            </FormData>
        </Declaration>"#;
        let doc = wrap(&declarer(ENTITY, decl));
        let bundle = parse_document("flag.xml", &doc, ENTITY).unwrap();
        assert_eq!(bundle.corrective_lines[0].1.category, Category::Goods);
    }
}
