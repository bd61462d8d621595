//! Builder and parser for the bundle manifest.
//!
//! The manifest is the single persisted artifact binding a bundle
//! together: bundler identity, machine configuration, image metadata,
//! the dually RSA-wrapped key material, and the ordered part list with
//! per-part digests.  State crosses the bundle/unbundle process
//! boundary exclusively through this document and the part files.
//!
//! The optional `<signature>` covers exactly the serialized
//! `<machine_configuration>` and `<image>` fragments, concatenated — not
//! the whole document.  The fragments are re-extracted from the
//! already-serialized bytes so the signature covers literally what is
//! persisted.  Serialization is deterministic (single line, fixed
//! element order), which keeps the extraction exact.

use std::path::Path;

use log::info;
use quick_xml::{
    events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event},
    Reader, Writer,
};
use thiserror::Error;

use crate::{
    crypto::{self, CryptoError},
    parts::PartInfo,
    BUNDLER_NAME, BUNDLER_RELEASE, BUNDLER_VERSION, MANIFEST_VERSION, PAYLOAD_CIPHER,
};

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("malformed manifest XML: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("malformed manifest XML attribute: {0}")]
    Attr(#[from] quick_xml::events::attributes::AttrError),

    #[error("manifest is missing required element <{0}>")]
    MissingElement(&'static str),

    #[error("manifest element <{element}> does not contain a number: {text:?}")]
    BadNumber { element: &'static str, text: String },

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// `<machine_configuration>` section of the manifest.
#[derive(Debug, Clone, Default)]
pub struct MachineConfiguration {
    pub architecture: String,
    /// (virtual name, device name) pairs.
    pub block_device_mapping: Vec<(String, String)>,
    pub product_codes: Vec<String>,
    pub kernel_id: Option<String>,
    pub ramdisk_id: Option<String>,
}

/// `<image>` section of the manifest.
#[derive(Debug, Clone)]
pub struct ImageSection {
    /// Bare file name of the bundled image.
    pub name: String,
    /// Owning user (account) id.
    pub user: String,
    pub image_type: String,
    pub ancestor_ami_ids: Vec<String>,
    /// Hex SHA-1 of the pre-encryption tar stream.
    pub digest: String,
    /// Plaintext image size in bytes.
    pub size: u64,
    /// Post-encryption payload size in bytes.
    pub bundled_size: u64,
    pub ec2_encrypted_key: String,
    pub user_encrypted_key: String,
    pub ec2_encrypted_iv: String,
    pub user_encrypted_iv: String,
    pub parts: Vec<PartInfo>,
}

#[derive(Debug, Clone)]
pub struct Manifest {
    pub machine: MachineConfiguration,
    pub image: ImageSection,
    /// Hex RSA-SHA1 signature, present when the producer signed.
    pub signature: Option<String>,
}

fn text_element<W: std::io::Write>(
    w: &mut Writer<W>,
    name: &str,
    value: &str,
) -> Result<(), ManifestError> {
    w.write_event(Event::Start(BytesStart::new(name)))?;
    w.write_event(Event::Text(BytesText::new(value)))?;
    w.write_event(Event::End(BytesEnd::new(name)))?;
    Ok(())
}

fn text_element_with_attr<W: std::io::Write>(
    w: &mut Writer<W>,
    name: &str,
    attr: (&str, &str),
    value: &str,
) -> Result<(), ManifestError> {
    let mut start = BytesStart::new(name);
    start.push_attribute(attr);
    w.write_event(Event::Start(start))?;
    w.write_event(Event::Text(BytesText::new(value)))?;
    w.write_event(Event::End(BytesEnd::new(name)))?;
    Ok(())
}

impl Manifest {
    pub fn new(machine: MachineConfiguration, image: ImageSection) -> Self {
        Manifest {
            machine,
            image,
            signature: None,
        }
    }

    /// Serialize to the fixed manifest schema.  Output is deterministic:
    /// a single line with a fixed element order and no added whitespace.
    pub fn to_xml(&self) -> Result<String, ManifestError> {
        let mut writer = Writer::new(Vec::new());

        writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
        writer.write_event(Event::Start(BytesStart::new("manifest")))?;

        text_element(&mut writer, "version", MANIFEST_VERSION)?;

        writer.write_event(Event::Start(BytesStart::new("bundler")))?;
        text_element(&mut writer, "name", BUNDLER_NAME)?;
        text_element(&mut writer, "version", BUNDLER_VERSION)?;
        text_element(&mut writer, "release", BUNDLER_RELEASE)?;
        writer.write_event(Event::End(BytesEnd::new("bundler")))?;

        self.write_machine_configuration(&mut writer)?;
        self.write_image(&mut writer)?;

        if let Some(ref signature) = self.signature {
            text_element(&mut writer, "signature", signature)?;
        }

        writer.write_event(Event::End(BytesEnd::new("manifest")))?;

        let bytes = writer.into_inner();
        Ok(String::from_utf8(bytes).expect("writer output is UTF-8"))
    }

    fn write_machine_configuration<W: std::io::Write>(
        &self,
        w: &mut Writer<W>,
    ) -> Result<(), ManifestError> {
        let mc = &self.machine;

        w.write_event(Event::Start(BytesStart::new("machine_configuration")))?;
        text_element(w, "architecture", &mc.architecture)?;

        if !mc.block_device_mapping.is_empty() {
            w.write_event(Event::Start(BytesStart::new("block_device_mapping")))?;
            for (virtual_name, device) in &mc.block_device_mapping {
                w.write_event(Event::Start(BytesStart::new("mapping")))?;
                text_element(w, "virtual", virtual_name)?;
                text_element(w, "device", device)?;
                w.write_event(Event::End(BytesEnd::new("mapping")))?;
            }
            w.write_event(Event::End(BytesEnd::new("block_device_mapping")))?;
        }

        if !mc.product_codes.is_empty() {
            w.write_event(Event::Start(BytesStart::new("product_codes")))?;
            for code in &mc.product_codes {
                text_element(w, "product_code", code)?;
            }
            w.write_event(Event::End(BytesEnd::new("product_codes")))?;
        }

        if let Some(ref kernel) = mc.kernel_id {
            text_element(w, "kernel_id", kernel)?;
        }
        if let Some(ref ramdisk) = mc.ramdisk_id {
            text_element(w, "ramdisk_id", ramdisk)?;
        }

        w.write_event(Event::End(BytesEnd::new("machine_configuration")))?;
        Ok(())
    }

    fn write_image<W: std::io::Write>(&self, w: &mut Writer<W>) -> Result<(), ManifestError> {
        let img = &self.image;

        w.write_event(Event::Start(BytesStart::new("image")))?;
        text_element(w, "name", &img.name)?;
        text_element(w, "user", &img.user)?;
        text_element(w, "type", &img.image_type)?;

        if !img.ancestor_ami_ids.is_empty() {
            w.write_event(Event::Start(BytesStart::new("ancestry")))?;
            for id in &img.ancestor_ami_ids {
                text_element(w, "ancestor_ami_id", id)?;
            }
            w.write_event(Event::End(BytesEnd::new("ancestry")))?;
        }

        text_element_with_attr(w, "digest", ("algorithm", "SHA1"), &img.digest)?;
        text_element(w, "size", &img.size.to_string())?;
        text_element(w, "bundled_size", &img.bundled_size.to_string())?;

        text_element_with_attr(
            w,
            "ec2_encrypted_key",
            ("algorithm", PAYLOAD_CIPHER),
            &img.ec2_encrypted_key,
        )?;
        text_element_with_attr(
            w,
            "user_encrypted_key",
            ("algorithm", PAYLOAD_CIPHER),
            &img.user_encrypted_key,
        )?;
        text_element(w, "ec2_encrypted_iv", &img.ec2_encrypted_iv)?;
        text_element(w, "user_encrypted_iv", &img.user_encrypted_iv)?;

        let mut parts_start = BytesStart::new("parts");
        parts_start.push_attribute(("count", img.parts.len().to_string().as_str()));
        w.write_event(Event::Start(parts_start))?;
        for (index, part) in img.parts.iter().enumerate() {
            let mut part_start = BytesStart::new("part");
            part_start.push_attribute(("index", index.to_string().as_str()));
            w.write_event(Event::Start(part_start))?;
            text_element(w, "filename", &part.filename)?;
            text_element_with_attr(w, "digest", ("algorithm", "SHA1"), &part.digest)?;
            w.write_event(Event::End(BytesEnd::new("part")))?;
        }
        w.write_event(Event::End(BytesEnd::new("parts")))?;

        w.write_event(Event::End(BytesEnd::new("image")))?;
        Ok(())
    }

    /// Sign with the user's private key and return the signed document.
    ///
    /// The signature covers the concatenation of the serialized
    /// `<machine_configuration>` and `<image>` fragments, extracted from
    /// the serialized bytes themselves.
    pub fn sign(&mut self, private_key: &Path) -> Result<String, ManifestError> {
        let unsigned = self.to_xml()?;
        let fragments = signed_fragments(&unsigned)?;
        self.signature = Some(crypto::sign_fragments(fragments.as_bytes(), private_key)?);
        self.to_xml()
    }

    /// Serialize (signing when a private key is given) and write to
    /// `path`.
    pub fn write(&mut self, path: &Path, private_key: Option<&Path>) -> Result<(), ManifestError> {
        info!("generating manifest {}", path.display());
        let xml = match private_key {
            Some(key) => self.sign(key)?,
            None => self.to_xml()?,
        };
        std::fs::write(path, xml)?;
        Ok(())
    }
}

fn extract_fragment<'a>(xml: &'a str, name: &'static str) -> Result<&'a str, ManifestError> {
    let open = format!("<{name}>");
    let close = format!("</{name}>");
    let start = xml.find(&open);
    let end = xml.find(&close);
    match (start, end) {
        (Some(start), Some(end)) if start < end => Ok(&xml[start..end + close.len()]),
        _ => Err(ManifestError::MissingElement(name)),
    }
}

/// The exact byte span the manifest signature covers: the serialized
/// `<machine_configuration>` element followed by the `<image>` element.
pub fn signed_fragments(xml: &str) -> Result<String, ManifestError> {
    let machine = extract_fragment(xml, "machine_configuration")?;
    let image = extract_fragment(xml, "image")?;
    Ok(format!("{machine}{image}"))
}

/// Check a signed manifest document against the signer's certificate.
///
/// Only bytes inside the two signed fragments are covered; edits
/// anywhere else in the document do not affect the result.
pub fn verify_signature(xml: &str, cert_path: &Path) -> Result<bool, ManifestError> {
    let manifest = parse(xml)?;
    let signature = manifest
        .signature
        .ok_or(ManifestError::MissingElement("signature"))?;
    let fragments = signed_fragments(xml)?;
    Ok(crypto::verify_fragments(
        fragments.as_bytes(),
        &signature,
        cert_path,
    )?)
}

fn parse_number(element: &'static str, text: &str) -> Result<u64, ManifestError> {
    text.trim().parse().map_err(|_| ManifestError::BadNumber {
        element,
        text: text.to_string(),
    })
}

/// Parse a manifest document.
///
/// Tolerates manifests from other bundler versions that omit optional
/// sections (block device mappings, product codes, ancestry, sizes).
/// A missing parts list or missing user-encrypted key/IV is an error:
/// nothing useful can be done with such a manifest and returning
/// partial data would only defer the failure to a worse place.
pub fn parse(xml: &str) -> Result<Manifest, ManifestError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut stack: Vec<String> = vec![];
    let mut machine = MachineConfiguration::default();

    let mut name = None;
    let mut user = None;
    let mut image_type = None;
    let mut ancestors = vec![];
    let mut digest = None;
    let mut size = None;
    let mut bundled_size = None;
    let mut ec2_key = None;
    let mut user_key = None;
    let mut ec2_iv = None;
    let mut user_iv = None;
    let mut signature = None;

    // parts are collected with their index attribute so that a
    // reordered document still reassembles correctly
    let mut parts: Vec<(usize, PartInfo)> = vec![];
    let mut current_index = 0usize;
    let mut current_filename: Option<String> = None;
    let mut current_digest: Option<String> = None;
    let mut current_virtual: Option<String> = None;

    loop {
        match reader.read_event()? {
            Event::Start(start) => {
                let tag = String::from_utf8_lossy(start.name().as_ref()).into_owned();
                if tag == "part" {
                    current_index = match start.try_get_attribute("index")? {
                        Some(attr) => {
                            let text = attr.unescape_value()?;
                            parse_number("part", &text)? as usize
                        }
                        None => parts.len(),
                    };
                    current_filename = None;
                    current_digest = None;
                }
                stack.push(tag);
            }
            Event::End(_) => {
                let tag = stack.pop().unwrap_or_default();
                if tag == "part" {
                    let filename = current_filename
                        .take()
                        .ok_or(ManifestError::MissingElement("filename"))?;
                    parts.push((
                        current_index,
                        PartInfo {
                            filename,
                            digest: current_digest.take().unwrap_or_default(),
                            size: 0,
                        },
                    ));
                }
            }
            Event::Text(text) => {
                let value = text.unescape()?.into_owned();
                let element = stack.last().map(String::as_str).unwrap_or("");
                let parent = stack
                    .iter()
                    .rev()
                    .nth(1)
                    .map(String::as_str)
                    .unwrap_or("");

                match (parent, element) {
                    ("image", "name") => name = Some(value),
                    ("image", "user") => user = Some(value),
                    ("image", "type") => image_type = Some(value),
                    ("image", "digest") => digest = Some(value),
                    ("image", "size") => size = Some(parse_number("size", &value)?),
                    ("image", "bundled_size") => {
                        bundled_size = Some(parse_number("bundled_size", &value)?)
                    }
                    ("image", "ec2_encrypted_key") => ec2_key = Some(value),
                    ("image", "user_encrypted_key") => user_key = Some(value),
                    ("image", "ec2_encrypted_iv") => ec2_iv = Some(value),
                    ("image", "user_encrypted_iv") => user_iv = Some(value),
                    ("ancestry", "ancestor_ami_id") => ancestors.push(value),
                    ("machine_configuration", "architecture") => machine.architecture = value,
                    ("machine_configuration", "kernel_id") => machine.kernel_id = Some(value),
                    ("machine_configuration", "ramdisk_id") => machine.ramdisk_id = Some(value),
                    ("product_codes", "product_code") => machine.product_codes.push(value),
                    ("mapping", "virtual") => current_virtual = Some(value),
                    ("mapping", "device") => {
                        if let Some(virtual_name) = current_virtual.take() {
                            machine.block_device_mapping.push((virtual_name, value));
                        }
                    }
                    ("part", "filename") => current_filename = Some(value),
                    ("part", "digest") => current_digest = Some(value),
                    ("manifest", "signature") => signature = Some(value),
                    _ => {}
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if parts.is_empty() {
        return Err(ManifestError::MissingElement("parts"));
    }
    parts.sort_by_key(|(index, _)| *index);
    let parts = parts.into_iter().map(|(_, part)| part).collect();

    let image = ImageSection {
        name: name.unwrap_or_default(),
        user: user.unwrap_or_default(),
        image_type: image_type.unwrap_or_else(|| "machine".to_string()),
        ancestor_ami_ids: ancestors,
        digest: digest.unwrap_or_default(),
        size: size.unwrap_or_default(),
        bundled_size: bundled_size.unwrap_or_default(),
        ec2_encrypted_key: ec2_key.unwrap_or_default(),
        user_encrypted_key: user_key.ok_or(ManifestError::MissingElement("user_encrypted_key"))?,
        ec2_encrypted_iv: ec2_iv.unwrap_or_default(),
        user_encrypted_iv: user_iv.ok_or(ManifestError::MissingElement("user_encrypted_iv"))?,
        parts,
    };

    Ok(Manifest {
        machine,
        image,
        signature,
    })
}

/// Read and parse a manifest file.
pub fn parse_file(path: &Path) -> Result<Manifest, ManifestError> {
    let xml = std::fs::read_to_string(path)?;
    parse(&xml)
}
