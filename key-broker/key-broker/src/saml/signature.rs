// Copyright (c) 2024 Alibaba Cloud
//
// SPDX-License-Identifier: Apache-2.0
//

//! Enveloped XML signatures over host verification reports. Digests and
//! the signature value are checked by xmlsec through samael, which
//! canonicalizes the assertion as its `<SignedInfo>` declares. The checks
//! here pin what the signature may cover before xmlsec looks at it.

use base64::{engine::general_purpose::STANDARD, Engine};
use log::warn;
use xmltree::{Element, XMLNode};

use crate::error::{Error, Result};

pub const TRANSFORM_ENVELOPED: &str = "http://www.w3.org/2000/09/xmldsig#enveloped-signature";
pub const TRANSFORM_EXC_C14N: &str = "http://www.w3.org/2001/10/xml-exc-c14n#";
pub const TRANSFORM_EXC_C14N_COMMENTS: &str =
    "http://www.w3.org/2001/10/xml-exc-c14n#WithComments";

const ID_ATTRIBUTE: &str = "ID";

/// Certificates carried in the signature's `<KeyInfo>`. The first one
/// signed the report; any others lead toward a trusted root.
#[derive(Debug)]
pub struct SignerChain {
    pub signer: Vec<u8>,
    pub intermediates: Vec<Vec<u8>>,
}

fn rejected(reason: &str) -> Error {
    warn!("SAML report signature rejected: {reason}");
    Error::Unauthorized("invalid report signature".to_string())
}

fn child<'a>(parent: &'a Element, name: &str) -> Result<&'a Element> {
    parent
        .get_child(name)
        .ok_or_else(|| rejected(&format!("missing {name} element")))
}

fn child_elements<'a>(parent: &'a Element, name: &'a str) -> impl Iterator<Item = &'a Element> {
    parent
        .children
        .iter()
        .filter_map(XMLNode::as_element)
        .filter(move |element| element.name == name)
}

fn count_signatures(element: &Element) -> usize {
    let own = usize::from(element.name == "Signature");
    own + element
        .children
        .iter()
        .filter_map(XMLNode::as_element)
        .map(count_signatures)
        .sum::<usize>()
}

fn base64_text(element: &Element) -> Result<Vec<u8>> {
    let text = element
        .get_text()
        .ok_or_else(|| rejected(&format!("{} is empty", element.name)))?;
    let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    STANDARD
        .decode(compact)
        .map_err(|_| rejected(&format!("{} is not base64", element.name)))
}

/// The single reference must name `root_id` and may only strip the
/// signature and canonicalize. Anything else could narrow what is signed.
fn check_reference(signed_info: &Element, root_id: &str) -> Result<()> {
    let mut references = child_elements(signed_info, "Reference");
    let reference = references
        .next()
        .ok_or_else(|| rejected("missing Reference element"))?;
    if references.next().is_some() {
        return Err(rejected("signature has more than one reference"));
    }

    let uri = reference.attributes.get("URI").map(String::as_str);
    if uri != Some(format!("#{root_id}").as_str()) {
        return Err(rejected("signature does not reference the report"));
    }

    if let Some(transforms) = reference.get_child("Transforms") {
        for transform in child_elements(transforms, "Transform") {
            match transform.attributes.get("Algorithm").map(String::as_str) {
                Some(TRANSFORM_ENVELOPED | TRANSFORM_EXC_C14N | TRANSFORM_EXC_C14N_COMMENTS) => {}
                other => {
                    return Err(rejected(&format!(
                        "unsupported transform {}",
                        other.unwrap_or("(none)")
                    )))
                }
            }
        }
    }
    Ok(())
}

fn key_info_certificates(signature: &Element) -> Result<SignerChain> {
    let x509_data = child(child(signature, "KeyInfo")?, "X509Data")?;
    let mut certs = child_elements(x509_data, "X509Certificate")
        .map(base64_text)
        .collect::<Result<Vec<_>>>()?
        .into_iter();
    let signer = certs
        .next()
        .ok_or_else(|| rejected("missing X509Certificate element"))?;
    Ok(SignerChain {
        signer,
        intermediates: certs.collect(),
    })
}

/// Verify the enveloped signature of `root`, whose text is `xml`, and return
/// the certificates that came with it. Whether the signer is trusted is for
/// the caller to decide.
pub fn verify_enveloped_signature(xml: &str, root: &Element, root_id: &str) -> Result<SignerChain> {
    let signature = root
        .get_child("Signature")
        .ok_or_else(|| rejected("report is not signed"))?;
    // xmlsec checks the first signature in document order
    if count_signatures(root) != 1 {
        return Err(rejected("report carries more than one signature"));
    }
    check_reference(child(signature, "SignedInfo")?, root_id)?;

    let chain = key_info_certificates(signature)?;
    samael::crypto::verify_signed_xml(xml, &chain.signer, Some(ID_ATTRIBUTE))
        .map_err(|e| rejected(&format!("signature does not verify: {e}")))?;

    Ok(chain)
}
