//! The decoded content of one chip read together with its trust verdict.

use crate::{
    active_auth::ActiveAuthExchange,
    biometrics::{parse_dg2, parse_dg3, parse_dg5, parse_dg7, BiometricImage},
    details::{parse_dg11, parse_dg12, AdditionalDocumentDetails, AdditionalPersonDetails},
    lds::{parse_dg1, DataGroupId, DataGroupSet, EfCom},
    record::{MrzRecord, TravelDocumentRecord},
    security_info::SecurityInfos,
    session::AccessProtocol,
    status::{FeatureStatus, VerificationStatus},
    EmrtdError,
};
use alloc::{
    collections::BTreeMap,
    format,
    string::{String, ToString},
    vec::Vec,
};
use serde::Serialize;
use tracing::{error, warn};

/// Everything read from a document.
///
/// Fields stay `None` when the file was absent or did not decode, the raw bytes are
/// kept in `data_groups` either way.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Passport {
    #[serde(skip)]
    pub data_groups: DataGroupSet,
    pub access_protocol: Option<AccessProtocol>,
    pub ef_com: Option<EfCom>,
    pub card_access: Option<SecurityInfos>,
    /// DG1.
    pub mrz: Option<MrzRecord>,
    /// First face image of DG2.
    pub face: Option<BiometricImage>,
    pub fingerprints: Vec<BiometricImage>,
    pub portrait: Option<BiometricImage>,
    pub signature: Option<BiometricImage>,
    pub person_details: Option<AdditionalPersonDetails>,
    pub document_details: Option<AdditionalDocumentDetails>,
    pub security_infos: Option<SecurityInfos>,
    pub active_authentication: Option<ActiveAuthExchange>,
    pub features: FeatureStatus,
    pub verification: VerificationStatus,
}

/// Decodes one file, logging instead of failing.
fn decoded<T>(
    groups: &DataGroupSet,
    id: DataGroupId,
    parse: impl FnOnce(&[u8]) -> Result<T, EmrtdError>,
) -> Option<T> {
    let data = groups.get(id)?;
    match parse(data) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("{id} was read but does not decode: {e}");
            None
        }
    }
}

impl Passport {
    /// Decodes every file present in `data_groups`.
    #[must_use]
    pub fn from_data_groups(data_groups: DataGroupSet) -> Self {
        let first = |images: Vec<BiometricImage>| images.into_iter().next();
        Self {
            ef_com: decoded(&data_groups, DataGroupId::Com, EfCom::parse),
            mrz: decoded(&data_groups, DataGroupId::Dg1, parse_dg1),
            face: decoded(&data_groups, DataGroupId::Dg2, parse_dg2).and_then(first),
            fingerprints: decoded(&data_groups, DataGroupId::Dg3, parse_dg3).unwrap_or_default(),
            portrait: decoded(&data_groups, DataGroupId::Dg5, parse_dg5).and_then(first),
            signature: decoded(&data_groups, DataGroupId::Dg7, parse_dg7).and_then(first),
            person_details: decoded(&data_groups, DataGroupId::Dg11, parse_dg11),
            document_details: decoded(&data_groups, DataGroupId::Dg12, parse_dg12),
            security_infos: decoded(&data_groups, DataGroupId::Dg14, SecurityInfos::from_dg14),
            data_groups,
            ..Self::default()
        }
    }

    /// Flat key/value view for form filling. Only keys with a value are present.
    ///
    /// The `image` key holds the MIME type and size of the face image, not its bytes.
    #[must_use]
    pub fn export(&self) -> BTreeMap<String, String> {
        let mut bundle = BTreeMap::new();
        let mut put = |key: &str, value: Option<String>| {
            if let Some(value) = value.filter(|value| !value.is_empty()) {
                bundle.insert(key.to_string(), value);
            }
        };

        put(
            "image",
            self.face
                .as_ref()
                .map(|face| format!("{}; {} bytes", face.encoding.mime_type(), face.data.len())),
        );

        let fields = self.mrz.as_ref().map(TravelDocumentRecord::fields);
        let person = self.person_details.as_ref();
        let document = self.document_details.as_ref();
        put("given_names", fields.map(|f| f.given_names.clone()));
        put("surname", fields.map(|f| f.surname.clone()));
        put("name_of_holder", person.and_then(|p| p.name_of_holder.clone()));
        put(
            "date_of_birth",
            person
                .and_then(|p| p.full_date_of_birth.clone())
                .or_else(|| fields.map(|f| f.date_of_birth.to_string())),
        );
        put("gender", fields.map(|f| format!("{:?}", f.sex).to_uppercase()));
        put("document_number", fields.map(|f| f.document_number.clone()));
        put("date_of_expiry", fields.map(|f| f.date_of_expiry.to_string()));
        put("issuing_state", fields.map(|f| f.issuing_country.clone()));
        put("nationality", fields.map(|f| f.nationality.clone()));
        put("other_names", person.map(|p| p.other_names.join(", ")));
        put("custody_information", person.and_then(|p| p.custody_information.clone()));
        put("profession", person.and_then(|p| p.profession.clone()));
        put("telephone", person.and_then(|p| p.telephone.clone()));
        put("title", person.and_then(|p| p.title.clone()));
        put(
            "date_and_time_of_personalization",
            document.and_then(|d| d.date_and_time_of_personalization.clone()),
        );
        put("date_of_issue", document.and_then(|d| d.date_of_issue.clone()));
        put(
            "endorsements_and_observations",
            document.and_then(|d| d.endorsements_and_observations.clone()),
        );
        put("issuing_authority", document.and_then(|d| d.issuing_authority.clone()));
        put(
            "personalization_system_serial_number",
            document.and_then(|d| d.personalization_system_serial_number.clone()),
        );
        put(
            "tax_or_exit_requirements",
            document.and_then(|d| d.tax_or_exit_requirements.clone()),
        );
        put(
            "optional_data_1",
            self.mrz.as_ref().map(|record| record.optional_data().to_string()),
        );
        put(
            "optional_data_2",
            match &self.mrz {
                Some(MrzRecord::Td1(record)) => Some(record.optional_data_2.clone()),
                _ => None,
            },
        );
        bundle
    }

    /// The exported fields with the feature and verification status as JSON.
    ///
    /// # Errors
    ///
    /// `EmrtdError::JsonError` if serialization fails.
    pub fn to_json(&self) -> Result<String, EmrtdError> {
        #[derive(Serialize)]
        struct Export<'a> {
            fields: BTreeMap<String, String>,
            features: &'a FeatureStatus,
            verification: &'a VerificationStatus,
        }

        serde_json::to_string_pretty(&Export {
            fields: self.export(),
            features: &self.features,
            verification: &self.verification,
        })
        .map_err(|e| {
            error!("Passport does not serialize: {e}");
            EmrtdError::JsonError(e)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{asn1::encode_tlv, status::CheckResult};
    use hex_literal::hex;

    const TD3: &[u8] = b"P<UTOERIKSSON<<ANNA<MARIA<<<<<<<<<<<<<<<<<<<L898902C<3UTO6908061F9406236ZE184226B<<<<<14";

    fn dg1() -> Vec<u8> {
        encode_tlv(&[0x61], &encode_tlv(&[0x5F, 0x1F], TD3))
    }

    #[test]
    fn test_export() {
        let mut groups = DataGroupSet::new();
        groups.insert(DataGroupId::Dg1, dg1());
        groups.insert(
            DataGroupId::Dg11,
            encode_tlv(
                &[0x6B],
                &[
                    encode_tlv(&[0x5C], &hex!("5F0E 5F2B")),
                    encode_tlv(&[0x5F, 0x0E], b"ERIKSSON<<ANNA<MARIA"),
                    encode_tlv(&[0x5F, 0x2B], b"19690806"),
                ]
                .concat(),
            ),
        );
        // Broken files are skipped
        groups.insert(DataGroupId::Dg12, hex!("6C00").to_vec());

        let passport = Passport::from_data_groups(groups);
        assert!(passport.mrz.is_some());
        assert!(passport.document_details.is_none());
        assert!(passport.data_groups.contains(DataGroupId::Dg12));

        let bundle = passport.export();
        assert_eq!(bundle["surname"], "ERIKSSON");
        assert_eq!(bundle["given_names"], "ANNA MARIA");
        assert_eq!(bundle["name_of_holder"], "ERIKSSON, ANNA MARIA");
        assert_eq!(bundle["date_of_birth"], "19690806");
        assert_eq!(bundle["gender"], "FEMALE");
        assert_eq!(bundle["document_number"], "L898902C");
        assert_eq!(bundle["date_of_expiry"], "940623");
        assert_eq!(bundle["issuing_state"], "UTO");
        assert_eq!(bundle["optional_data_1"], "ZE184226B");
        assert!(!bundle.contains_key("image"));
        assert!(!bundle.contains_key("issuing_authority"));
        assert!(!bundle.contains_key("optional_data_2"));
    }

    #[test]
    fn test_to_json() -> Result<(), EmrtdError> {
        let mut groups = DataGroupSet::new();
        groups.insert(DataGroupId::Dg1, dg1());
        let mut passport = Passport::from_data_groups(groups);
        passport.verification.bac = CheckResult::succeeded("");
        passport.features.set_bac(true);

        let json: serde_json::Value =
            serde_json::from_str(&passport.to_json()?).map_err(EmrtdError::JsonError)?;
        assert_eq!(json["fields"]["nationality"], "UTO");
        assert_eq!(json["verification"]["bac"]["verdict"], "SUCCEEDED");
        assert_eq!(json["verification"]["ht"]["verdict"], "UNKNOWN");
        assert_eq!(json["features"]["bac"], "PRESENT");
        Ok(())
    }
}
