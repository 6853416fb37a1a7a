//! Parser for SDMX-ML structure documents.
//!
//! Walks the XML event stream matching on local element names, so the
//! namespace prefixes used by different SDMX endpoints do not matter.
//! Declaration order of dimensions and attributes is preserved; it becomes
//! the column order of the target table.
//!
//! One document may carry a data structure, code lists, or both (Eurostat's
//! `?references=datastructure` dataflow responses bundle them).

use std::collections::BTreeMap;
use std::path::Path;

use estat_common::{EstatError, Result};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use tracing::{debug, warn};

use crate::models::{Attribute, Code, Codelist, Dimension, Dsd, DEFAULT_PRIMARY_MEASURE};

/// Everything found in one SDMX-ML document.
#[derive(Debug, Default)]
pub struct SdmxDocument {
    pub dsd: Option<Dsd>,
    pub codelists: Vec<Codelist>,
}

/// Parses SDMX-ML files into [`Dsd`]s and [`Codelist`]s.
pub struct SdmxParser;

impl SdmxParser {
    pub fn new() -> Self {
        Self
    }

    /// Parse a DSD out of a structure document. Fails with `DsdInvalid` when
    /// the document carries no data structure or the structure has no time
    /// dimension.
    pub fn parse_dsd(&self, path: &Path, dataset_id: &str) -> Result<Dsd> {
        let doc = self.parse_structures(path, dataset_id)?;
        let dsd = doc.dsd.ok_or_else(|| {
            EstatError::dsd_invalid(dataset_id, "document contains no data structure")
        })?;
        dsd.validate()?;
        Ok(dsd)
    }

    /// Parse all code lists out of a structure document.
    pub fn parse_codelists(&self, path: &Path, dataset_id: &str) -> Result<Vec<Codelist>> {
        Ok(self.parse_structures(path, dataset_id)?.codelists)
    }

    /// Single walk over the document collecting the data structure and every
    /// code list, in document order.
    pub fn parse_structures(&self, path: &Path, dataset_id: &str) -> Result<SdmxDocument> {
        let content = std::fs::read_to_string(path)?;
        self.parse_structures_str(&content, dataset_id)
    }

    fn parse_structures_str(&self, content: &str, dataset_id: &str) -> Result<SdmxDocument> {
        let mut reader = Reader::from_str(content);
        reader.config_mut().trim_text(true);

        let mut walker = Walker::new(dataset_id);

        loop {
            let event = reader.read_event().map_err(|e| {
                EstatError::dsd_invalid(dataset_id, format!("XML parse error: {e}"))
            })?;
            match event {
                Event::Start(ref e) => walker.open(e, false)?,
                Event::Empty(ref e) => walker.open(e, true)?,
                Event::End(ref e) => walker.close(e.local_name().as_ref()),
                Event::Text(ref t) => {
                    let text = t.unescape().map_err(|e| {
                        EstatError::dsd_invalid(dataset_id, format!("XML text error: {e}"))
                    })?;
                    walker.text(&text);
                },
                Event::Eof => break,
                _ => {},
            }
        }

        walker.finish()
    }
}

impl Default for SdmxParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Which component of the DSD is currently open.
#[derive(Debug, Clone, Copy, PartialEq)]
enum ComponentKind {
    Dimension,
    TimeDimension,
    Attribute,
    PrimaryMeasure,
}

/// Where the next text event should land.
#[derive(Debug, Clone, Copy, PartialEq)]
enum TextTarget {
    Name,
    Description,
}

/// A translatable value: keeps the first text seen, but lets an English
/// variant replace a non-English one.
#[derive(Debug, Default)]
struct LangText {
    value: Option<String>,
    is_en: bool,
}

impl LangText {
    fn offer(&mut self, text: &str, lang_is_en: bool) {
        if self.value.is_none() || (lang_is_en && !self.is_en) {
            self.value = Some(text.to_string());
            self.is_en = lang_is_en;
        }
    }
}

struct Walker {
    dataset_id: String,

    // DSD under construction
    dsd_id: Option<String>,
    dsd_version: Option<String>,
    dsd_name: LangText,
    in_data_structure: bool,
    dimensions: Vec<Dimension>,
    time_dimension: Option<String>,
    attributes: Vec<Attribute>,
    primary_measure: Option<String>,
    position_counter: usize,

    // Open component state
    component: Option<ComponentKind>,
    component_id: Option<String>,
    component_name: LangText,
    component_codelist: Option<String>,
    in_enumeration: bool,

    // Code list under construction
    codelists: Vec<Codelist>,
    current_list: Option<(String, String, BTreeMap<String, Code>)>,
    current_code: Option<CodeBuilder>,
    in_parent: bool,

    // Text routing
    text_target: Option<(TextTarget, bool)>,
}

#[derive(Debug, Default)]
struct CodeBuilder {
    id: String,
    name: LangText,
    description: LangText,
    parent: Option<String>,
}

impl Walker {
    fn new(dataset_id: &str) -> Self {
        Self {
            dataset_id: dataset_id.to_string(),
            dsd_id: None,
            dsd_version: None,
            dsd_name: LangText::default(),
            in_data_structure: false,
            dimensions: Vec::new(),
            time_dimension: None,
            attributes: Vec::new(),
            primary_measure: None,
            position_counter: 0,
            component: None,
            component_id: None,
            component_name: LangText::default(),
            component_codelist: None,
            in_enumeration: false,
            codelists: Vec::new(),
            current_list: None,
            current_code: None,
            in_parent: false,
            text_target: None,
        }
    }

    fn open(&mut self, e: &BytesStart<'_>, self_closing: bool) -> Result<()> {
        let local = e.local_name();
        match local.as_ref() {
            b"DataStructure" if self.dsd_id.is_none() => {
                self.in_data_structure = true;
                self.dsd_id = attr(e, b"id");
                self.dsd_version = attr(e, b"version");
            },
            b"Dimension" if self.in_data_structure => {
                self.begin_component(ComponentKind::Dimension, e, self_closing);
            },
            b"TimeDimension" if self.in_data_structure => {
                self.begin_component(ComponentKind::TimeDimension, e, self_closing);
            },
            b"Attribute" if self.in_data_structure => {
                self.begin_component(ComponentKind::Attribute, e, self_closing);
            },
            b"PrimaryMeasure" | b"Measure" if self.in_data_structure => {
                self.begin_component(ComponentKind::PrimaryMeasure, e, self_closing);
            },
            b"Enumeration" if !self_closing => {
                self.in_enumeration = true;
            },
            b"Ref" => {
                if self.in_enumeration && self.component.is_some() {
                    self.component_codelist = attr(e, b"id");
                } else if self.in_parent {
                    if let Some(code) = self.current_code.as_mut() {
                        code.parent = attr(e, b"id");
                    }
                }
            },
            b"Codelist" => {
                let id = attr(e, b"id").ok_or_else(|| {
                    EstatError::dsd_invalid(&self.dataset_id, "code list without id")
                })?;
                let version = attr(e, b"version").unwrap_or_else(|| "1.0".to_string());
                if self_closing {
                    self.codelists.push(Codelist {
                        id,
                        version,
                        codes: BTreeMap::new(),
                    });
                } else {
                    self.current_list = Some((id, version, BTreeMap::new()));
                }
            },
            b"Code" if self.current_list.is_some() => {
                let id = attr(e, b"id").ok_or_else(|| {
                    EstatError::dsd_invalid(&self.dataset_id, "code without id")
                })?;
                if self_closing {
                    // No children: the code is its own label.
                    if let Some((_, _, codes)) = self.current_list.as_mut() {
                        codes.insert(
                            id.clone(),
                            Code {
                                id: id.clone(),
                                label: id,
                                description: None,
                                parent_code: None,
                            },
                        );
                    }
                } else {
                    self.current_code = Some(CodeBuilder {
                        id,
                        ..CodeBuilder::default()
                    });
                }
            },
            b"Parent" if !self_closing => {
                self.in_parent = true;
            },
            b"Name" if !self_closing => {
                self.text_target = Some((TextTarget::Name, lang_is_en(e)));
            },
            b"Description" if !self_closing => {
                self.text_target = Some((TextTarget::Description, lang_is_en(e)));
            },
            _ => {},
        }
        Ok(())
    }

    fn begin_component(&mut self, kind: ComponentKind, e: &BytesStart<'_>, self_closing: bool) {
        let id = attr(e, b"id").map(|s| s.to_lowercase());
        if self_closing {
            self.component = Some(kind);
            self.component_id = id;
            self.end_component();
        } else {
            self.component = Some(kind);
            self.component_id = id;
            self.component_name = LangText::default();
            self.component_codelist = None;
        }
    }

    fn end_component(&mut self) {
        let Some(kind) = self.component.take() else {
            return;
        };
        let id = self.component_id.take();
        let name = self.component_name.value.take();
        let codelist_id = self.component_codelist.take();

        match (kind, id) {
            (ComponentKind::Dimension, Some(id)) => {
                self.dimensions.push(Dimension {
                    id,
                    name,
                    codelist_id,
                    position: self.position_counter,
                });
                self.position_counter += 1;
            },
            (ComponentKind::TimeDimension, Some(id)) => {
                self.time_dimension = Some(id);
            },
            (ComponentKind::Attribute, Some(id)) => {
                self.attributes.push(Attribute {
                    id,
                    name,
                    codelist_id,
                });
            },
            (ComponentKind::PrimaryMeasure, Some(id)) => {
                self.primary_measure = Some(id);
            },
            (_, None) => {},
        }
    }

    fn close(&mut self, local: &[u8]) {
        match local {
            b"DataStructure" => self.in_data_structure = false,
            b"Dimension" | b"TimeDimension" | b"Attribute" | b"PrimaryMeasure" | b"Measure" => {
                self.end_component();
            },
            b"Enumeration" => self.in_enumeration = false,
            b"Parent" => self.in_parent = false,
            b"Code" => {
                if let (Some(code), Some((list_id, _, codes))) =
                    (self.current_code.take(), self.current_list.as_mut())
                {
                    let entry = Code {
                        id: code.id.clone(),
                        label: code.name.value.unwrap_or_else(|| code.id.clone()),
                        description: code.description.value,
                        parent_code: code.parent,
                    };
                    if codes.insert(code.id.clone(), entry).is_some() {
                        warn!(
                            codelist = %list_id,
                            code = %code.id,
                            "duplicate code in list, last occurrence wins"
                        );
                    }
                }
            },
            b"Codelist" => {
                if let Some((id, version, codes)) = self.current_list.take() {
                    debug!(codelist = %id, codes = codes.len(), "parsed code list");
                    self.codelists.push(Codelist { id, version, codes });
                }
            },
            b"Name" | b"Description" => self.text_target = None,
            _ => {},
        }
    }

    fn text(&mut self, text: &str) {
        let Some((target, is_en)) = self.text_target else {
            return;
        };
        match target {
            TextTarget::Name => {
                if let Some(code) = self.current_code.as_mut() {
                    code.name.offer(text, is_en);
                } else if self.component.is_some() {
                    self.component_name.offer(text, is_en);
                } else if self.in_data_structure {
                    self.dsd_name.offer(text, is_en);
                }
            },
            TextTarget::Description => {
                if let Some(code) = self.current_code.as_mut() {
                    code.description.offer(text, is_en);
                }
            },
        }
    }

    fn finish(mut self) -> Result<SdmxDocument> {
        let dsd = match self.dsd_id {
            Some(id) => {
                // Some structures declare the time axis as a plain dimension
                // named TIME_PERIOD instead of a TimeDimension element.
                if self.time_dimension.is_none() {
                    if let Some(pos) = self
                        .dimensions
                        .iter()
                        .position(|d| d.id == "time_period" || d.id == "time")
                    {
                        self.time_dimension = Some(self.dimensions.remove(pos).id);
                    }
                }

                let time_dimension = self.time_dimension.ok_or_else(|| {
                    EstatError::dsd_invalid(&self.dataset_id, "no time dimension declared")
                })?;

                Some(Dsd {
                    id: id.to_lowercase(),
                    name: self.dsd_name.value,
                    version: self.dsd_version.unwrap_or_else(|| "1.0".to_string()),
                    dimensions: self.dimensions,
                    time_dimension,
                    attributes: self.attributes,
                    primary_measure_id: self
                        .primary_measure
                        .unwrap_or_else(|| DEFAULT_PRIMARY_MEASURE.to_string()),
                })
            },
            None => None,
        };

        Ok(SdmxDocument {
            dsd,
            codelists: self.codelists,
        })
    }
}

fn attr(e: &BytesStart<'_>, name: &[u8]) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|a| a.key.local_name().as_ref() == name)
        .and_then(|a| a.unescape_value().ok())
        .map(|v| v.into_owned())
}

fn lang_is_en(e: &BytesStart<'_>) -> bool {
    e.attributes()
        .flatten()
        .find(|a| a.key.local_name().as_ref() == b"lang")
        .map(|a| a.value.as_ref() == b"en")
        .unwrap_or(true)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const STRUCTURE_DOC: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<mes:Structure xmlns:mes="http://www.sdmx.org/resources/sdmxml/schemas/v2_1/message"
               xmlns:str="http://www.sdmx.org/resources/sdmxml/schemas/v2_1/structure"
               xmlns:com="http://www.sdmx.org/resources/sdmxml/schemas/v2_1/common">
  <mes:Structures>
    <str:Codelists>
      <str:Codelist id="CL_GEO" version="2.1">
        <com:Name xml:lang="en">Geopolitical entity</com:Name>
        <str:Code id="DE">
          <com:Name xml:lang="de">Deutschland</com:Name>
          <com:Name xml:lang="en">Germany</com:Name>
        </str:Code>
        <str:Code id="FR">
          <com:Name xml:lang="en">France</com:Name>
          <com:Description xml:lang="en">French Republic</com:Description>
        </str:Code>
        <str:Code id="EU27">
          <com:Name xml:lang="en">European Union</com:Name>
          <str:Parent><Ref id="DE"/></str:Parent>
        </str:Code>
      </str:Codelist>
      <str:Codelist id="CL_FREQ" version="1.0">
        <str:Code id="A">
          <com:Name xml:lang="en">Annual</com:Name>
        </str:Code>
      </str:Codelist>
    </str:Codelists>
    <str:DataStructures>
      <str:DataStructure id="NAMA_10_GDP" version="3.0">
        <com:Name xml:lang="en">GDP and main components</com:Name>
        <str:DataStructureComponents>
          <str:DimensionList>
            <str:Dimension id="FREQ" position="1">
              <str:ConceptIdentity><Ref id="FREQ"/></str:ConceptIdentity>
              <str:LocalRepresentation>
                <str:Enumeration><Ref id="CL_FREQ" class="Codelist"/></str:Enumeration>
              </str:LocalRepresentation>
            </str:Dimension>
            <str:Dimension id="GEO" position="2">
              <str:LocalRepresentation>
                <str:Enumeration><Ref id="CL_GEO" class="Codelist"/></str:Enumeration>
              </str:LocalRepresentation>
            </str:Dimension>
            <str:TimeDimension id="TIME_PERIOD" position="3"/>
          </str:DimensionList>
          <str:AttributeList>
            <str:Attribute id="OBS_FLAG">
              <str:ConceptIdentity><Ref id="OBS_FLAG"/></str:ConceptIdentity>
            </str:Attribute>
          </str:AttributeList>
          <str:MeasureList>
            <str:PrimaryMeasure id="OBS_VALUE"/>
          </str:MeasureList>
        </str:DataStructureComponents>
      </str:DataStructure>
    </str:DataStructures>
  </mes:Structures>
</mes:Structure>
"#;

    fn parse(content: &str) -> SdmxDocument {
        SdmxParser::new()
            .parse_structures_str(content, "nama_10_gdp")
            .unwrap()
    }

    #[test]
    fn test_parse_dsd_components_in_order() {
        let doc = parse(STRUCTURE_DOC);
        let dsd = doc.dsd.unwrap();

        assert_eq!(dsd.id, "nama_10_gdp");
        assert_eq!(dsd.version, "3.0");
        assert_eq!(dsd.name.as_deref(), Some("GDP and main components"));
        assert_eq!(dsd.dimension_ids(), vec!["freq", "geo"]);
        assert_eq!(dsd.time_dimension, "time_period");
        assert_eq!(dsd.primary_measure_id, "obs_value");
        assert_eq!(dsd.attributes.len(), 1);
        assert_eq!(dsd.attributes[0].id, "obs_flag");
        assert_eq!(dsd.dimensions[0].codelist_id.as_deref(), Some("CL_FREQ"));
        assert_eq!(dsd.dimensions[1].codelist_id.as_deref(), Some("CL_GEO"));
        assert!(dsd.validate().is_ok());
    }

    #[test]
    fn test_concept_refs_do_not_leak_into_codelist_refs() {
        // FREQ's ConceptIdentity Ref (id=FREQ) must not be mistaken for an
        // enumeration reference.
        let doc = parse(STRUCTURE_DOC);
        let dsd = doc.dsd.unwrap();
        assert_eq!(dsd.dimensions[0].codelist_id.as_deref(), Some("CL_FREQ"));
    }

    #[test]
    fn test_parse_codelists_with_english_preference() {
        let doc = parse(STRUCTURE_DOC);
        assert_eq!(doc.codelists.len(), 2);

        let geo = &doc.codelists[0];
        assert_eq!(geo.id, "CL_GEO");
        assert_eq!(geo.label_for("DE"), Some("Germany"));
        assert_eq!(geo.label_for("FR"), Some("France"));
        assert_eq!(
            geo.codes.get("FR").unwrap().description.as_deref(),
            Some("French Republic")
        );
        assert_eq!(geo.codes.get("EU27").unwrap().parent_code.as_deref(), Some("DE"));
    }

    #[test]
    fn test_codelist_parents_are_acyclic() {
        let doc = parse(STRUCTURE_DOC);
        for list in &doc.codelists {
            for code in list.codes.values() {
                let mut seen = std::collections::HashSet::new();
                let mut cursor = Some(code);
                while let Some(c) = cursor {
                    assert!(seen.insert(c.id.as_str()), "cycle through {}", c.id);
                    cursor = c
                        .parent_code
                        .as_deref()
                        .and_then(|p| list.codes.get(p));
                }
            }
        }
    }

    #[test]
    fn test_missing_time_dimension_rejected() {
        let doc = STRUCTURE_DOC.replace(
            r#"<str:TimeDimension id="TIME_PERIOD" position="3"/>"#,
            "",
        );
        let err = SdmxParser::new()
            .parse_structures_str(&doc, "nama_10_gdp")
            .unwrap_err();
        assert!(matches!(err, EstatError::DsdInvalid { .. }));
    }

    #[test]
    fn test_plain_time_period_dimension_promoted() {
        let doc = STRUCTURE_DOC.replace(
            r#"<str:TimeDimension id="TIME_PERIOD" position="3"/>"#,
            r#"<str:Dimension id="TIME_PERIOD" position="3"/>"#,
        );
        let parsed = SdmxParser::new()
            .parse_structures_str(&doc, "nama_10_gdp")
            .unwrap();
        let dsd = parsed.dsd.unwrap();
        assert_eq!(dsd.time_dimension, "time_period");
        assert_eq!(dsd.dimension_ids(), vec!["freq", "geo"]);
    }

    #[test]
    fn test_document_without_structure_yields_no_dsd() {
        let doc = r#"<?xml version="1.0"?>
<Structure><Structures>
  <Codelists>
    <Codelist id="CL_UNIT" version="1.0">
      <Code id="PC"><Name xml:lang="en">Percent</Name></Code>
    </Codelist>
  </Codelists>
</Structures></Structure>"#;
        let parsed = SdmxParser::new().parse_structures_str(doc, "x").unwrap();
        assert!(parsed.dsd.is_none());
        assert_eq!(parsed.codelists.len(), 1);
    }

    #[test]
    fn test_code_without_name_falls_back_to_id() {
        let doc = r#"<Structure>
  <Codelist id="CL_X" version="1.0"><Code id="Z1"/></Codelist>
</Structure>"#;
        let parsed = SdmxParser::new().parse_structures_str(doc, "x").unwrap();
        assert_eq!(parsed.codelists[0].label_for("Z1"), Some("Z1"));
    }
}
