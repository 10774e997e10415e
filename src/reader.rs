//! A complete read of one document: open the chip, read its files, then run Chip,
//! Passive and Active Authentication.

use crate::{
    active_auth::{authenticate_active, ActiveAuthExchange},
    apdu::EmrtdCard,
    chip_auth::authenticate_chip,
    comms::EmrtdComms,
    config::ReaderConfig,
    lds::{DataGroupId, DataGroupReader, DataGroupSet, EfCom},
    mrz::MrzSeed,
    passive_auth::PassiveAuthenticator,
    passport::Passport,
    security_info::SecurityInfos,
    session::{AccessProtocol, ChipSessionEstablisher, Establishment, OpenOutcome},
    status::{CheckResult, FeaturePresence, FeatureStatus, VerificationStatus},
    trust_store::TrustStore,
    ChipError,
};
use alloc::{sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicBool, Ordering};
use rand::{CryptoRng, RngCore};
use tracing::{error, info, warn};

/// Lets another thread stop a read between two chip operations.
///
/// A command already sent to the chip always completes.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), ChipError> {
        if self.is_cancelled() {
            warn!("Read cancelled");
            return Err(ChipError::Cancelled);
        }
        Ok(())
    }
}

/// What a read produced. `passport` holds whatever was read before `error` stopped
/// the read.
#[derive(Debug)]
pub struct ReadOutcome {
    pub passport: Passport,
    pub error: Option<ChipError>,
}

/// Runs the whole read sequence over one session.
#[derive(Debug, Clone, Default)]
pub struct PassportReader {
    config: ReaderConfig,
}

/// State carried through one read.
struct Read {
    groups: DataGroupSet,
    features: FeatureStatus,
    verification: VerificationStatus,
    access_protocol: Option<AccessProtocol>,
    card_access: Option<SecurityInfos>,
    dg14: Option<SecurityInfos>,
    active_auth: Option<ActiveAuthExchange>,
}

impl Read {
    fn finish(self, error: Option<ChipError>) -> ReadOutcome {
        let mut passport = Passport::from_data_groups(self.groups);
        passport.features = self.features;
        passport.verification = self.verification;
        passport.active_authentication = self.active_auth;
        passport.access_protocol = self.access_protocol;
        passport.card_access = self.card_access;
        if let Some(error) = &error {
            warn!("Read ended early: {error}");
        }
        ReadOutcome { passport, error }
    }
}

impl PassportReader {
    #[must_use]
    pub fn new(config: ReaderConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub fn config(&self) -> &ReaderConfig {
        &self.config
    }

    /// Reads and verifies the document in `comms`.
    ///
    /// Access control, reading, Chip Authentication, Passive Authentication and
    /// Active Authentication run in this order. Failing verifications are recorded in
    /// the `VerificationStatus`, only a failure to open the chip, a transport error or
    /// cancellation end the read early.
    pub fn read<C: EmrtdCard, R: RngCore + CryptoRng + Default>(
        &self,
        comms: &mut EmrtdComms<C, R>,
        seed: &MrzSeed,
        trust_store: &TrustStore,
        cancel: &CancellationToken,
    ) -> ReadOutcome {
        let mut read = Read {
            groups: DataGroupSet::new(),
            features: FeatureStatus::default(),
            verification: VerificationStatus::default(),
            access_protocol: None,
            card_access: None,
            dg14: None,
            active_auth: None,
        };
        let error = self.run(comms, seed, trust_store, cancel, &mut read).err();
        read.finish(error)
    }

    fn run<C: EmrtdCard, R: RngCore + CryptoRng + Default>(
        &self,
        comms: &mut EmrtdComms<C, R>,
        seed: &MrzSeed,
        trust_store: &TrustStore,
        cancel: &CancellationToken,
        read: &mut Read,
    ) -> Result<(), ChipError> {
        cancel.check()?;
        comms.set_max_read_length(self.config.max_read_length);

        let establishment =
            ChipSessionEstablisher::new(self.config.attempt_pace).establish(comms, seed);
        record_access(&establishment, self.config.attempt_pace, read);
        let Establishment {
            outcome,
            card_access,
            ef_com: probed_ef_com,
            ..
        } = establishment;
        read.card_access = card_access;
        match outcome {
            OpenOutcome::Verified(protocol) => read.access_protocol = Some(protocol),
            OpenOutcome::UnverifiedFallback => {}
            OpenOutcome::Failed(e) => {
                error!("Chip could not be opened: {e}");
                return Err(e);
            }
        }

        self.read_files(comms, probed_ef_com, cancel, read)?;
        let ef_com = read
            .groups
            .get(DataGroupId::Com)
            .and_then(|data| EfCom::parse(data).ok());

        // Chip Authentication
        cancel.check()?;
        read.dg14 = read
            .groups
            .get(DataGroupId::Dg14)
            .and_then(|data| match SecurityInfos::from_dg14(data) {
                Ok(infos) => Some(infos),
                Err(e) => {
                    warn!("EF.DG14 does not decode: {e}");
                    None
                }
            });
        let has_ca_keys = read
            .dg14
            .as_ref()
            .is_some_and(|infos| infos.chip_authentication_public_keys().next().is_some());
        read.features.set_ca(has_ca_keys);
        read.features.set_eac(
            read.dg14
                .as_ref()
                .is_some_and(SecurityInfos::has_terminal_authentication),
        );
        read.verification.ca = match (&read.dg14, self.config.chip_authentication) {
            (None, _) => CheckResult::not_present("no EF.DG14"),
            (Some(_), false) => CheckResult::not_checked("disabled"),
            (Some(dg14), true) => authenticate_chip(comms, dg14),
        };
        let chip_authenticated = read.verification.ca.is_succeeded();
        if chip_authenticated {
            // Hash verification needs DG14 as served over the new channel
            DataGroupReader::new(comms).read_into(DataGroupId::Dg14, &mut read.groups)?;
        }

        read.verification.eac = if read.features.eac == FeaturePresence::Present {
            CheckResult::not_checked("terminal authentication is not performed")
        } else {
            CheckResult::not_present("no TerminalAuthenticationInfo")
        };

        // Passive Authentication
        cancel.check()?;
        if self.config.passive_authentication {
            PassiveAuthenticator::new(trust_store)
                .verify(&read.groups, chip_authenticated)
                .apply(&mut read.verification);
        } else {
            let skipped = CheckResult::not_checked("disabled");
            read.verification.ht = skipped.clone();
            read.verification.ds = skipped.clone();
            read.verification.cs = skipped;
        }

        // Active Authentication
        cancel.check()?;
        let dg15 = read.groups.get(DataGroupId::Dg15).map(<[u8]>::to_vec);
        let aa_listed = ef_com
            .as_ref()
            .is_some_and(|com| com.lists(DataGroupId::Dg15));
        read.features.set_aa(dg15.is_some() || aa_listed);
        read.verification.aa = match (dg15, self.config.active_authentication) {
            (None, _) => CheckResult::not_present("no EF.DG15"),
            (Some(_), false) => CheckResult::not_checked("disabled"),
            (Some(dg15), true) => {
                let (result, exchange) = authenticate_active(comms, &dg15, read.dg14.as_ref());
                read.active_auth = exchange;
                result
            }
        };

        info!("Read finished\n{}", read.verification);
        Ok(())
    }

    /// Reads EF.COM, EF.SOD, DG1, DG2 and the configured optional files.
    fn read_files<C: EmrtdCard, R: RngCore + CryptoRng + Default>(
        &self,
        comms: &mut EmrtdComms<C, R>,
        probed_ef_com: Option<Vec<u8>>,
        cancel: &CancellationToken,
        read: &mut Read,
    ) -> Result<(), ChipError> {
        let mut reader = DataGroupReader::new(comms);
        match probed_ef_com {
            Some(ef_com) => read.groups.insert(DataGroupId::Com, ef_com),
            None => {
                cancel.check()?;
                reader.read_into(DataGroupId::Com, &mut read.groups)?;
            }
        }
        let ef_com = match read.groups.get(DataGroupId::Com).map(EfCom::parse) {
            Some(Ok(ef_com)) => Some(ef_com),
            Some(Err(e)) => {
                warn!("EF.COM does not decode, reading every configured file: {e}");
                None
            }
            None => None,
        };

        let mut wanted = Vec::from([DataGroupId::Sod, DataGroupId::Dg1, DataGroupId::Dg2]);
        wanted.extend(self.config.optional_groups());
        wanted.push(DataGroupId::Dg14);
        if self.config.read_dg15 || self.config.active_authentication {
            wanted.push(DataGroupId::Dg15);
        }

        for id in wanted {
            let mandatory = matches!(id, DataGroupId::Sod | DataGroupId::Dg1 | DataGroupId::Dg2);
            if !mandatory && ef_com.as_ref().is_some_and(|com| !com.lists(id)) {
                read.groups.mark_absent(id);
                continue;
            }
            cancel.check()?;
            reader.read_into(id, &mut read.groups)?;
        }
        Ok(())
    }
}

/// Access control verdicts and features learnt while opening the chip.
fn record_access(establishment: &Establishment, attempt_pace: bool, read: &mut Read) {
    let pace_offered = establishment
        .card_access
        .as_ref()
        .is_some_and(|infos| infos.pace_infos().next().is_some());
    read.features.set_sac(pace_offered);
    let verification = &mut read.verification;

    verification.sac = if !pace_offered {
        CheckResult::not_present("EF.CardAccess offers no PACE")
    } else if !attempt_pace {
        CheckResult::not_checked("disabled")
    } else if establishment.pace_failed {
        CheckResult::failed("PACE failed, fell back")
    } else {
        CheckResult::default()
    };

    match &establishment.outcome {
        OpenOutcome::Verified(AccessProtocol::Pace(mapping)) => {
            verification.sac = CheckResult::succeeded(alloc::format!("{mapping:?} mapping"));
            verification.bac = CheckResult::not_checked("PACE was used");
        }
        OpenOutcome::Verified(AccessProtocol::Bac) => {
            read.features.set_bac(true);
            verification.bac = CheckResult::succeeded("");
        }
        OpenOutcome::UnverifiedFallback => {
            read.features.set_bac(false);
            verification.bac = CheckResult::not_present("chip has no access control");
        }
        OpenOutcome::Failed(e) => {
            let pace_attempted = pace_offered && attempt_pace && !establishment.pace_failed;
            if pace_attempted {
                verification.sac = CheckResult::failed(e);
                verification.bac = CheckResult::not_checked("PACE failed");
            } else {
                verification.bac = CheckResult::failed(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        asn1::encode_tlv,
        status::{HashCheck, Verdict},
        testing::{
            chip_authentication_dg14, ec_key_pair, lds_security_object, rsa_pkey, signed_data, MockRng,
            TestPki, VirtualPassport,
        },
    };
    use hex_literal::hex;

    const MRZ_KEY: &str = "L898902C<369080619406236";
    const TD3: &[u8] = b"P<UTOERIKSSON<<ANNA<MARIA<<<<<<<<<<<<<<<<<<<L898902C<3UTO6908061F9406236ZE184226B<<<<<14";
    const DG2: [u8; 6] = hex!("7504 7F61 0100");

    fn seed() -> MrzSeed {
        MrzSeed::new("L898902C", "690806", "940623").unwrap()
    }

    fn dg1() -> Vec<u8> {
        encode_tlv(&[0x61], &encode_tlv(&[0x5F, 0x1F], TD3))
    }

    fn ef_com(tags: &[u8]) -> Vec<u8> {
        encode_tlv(
            &[0x60],
            &[
                encode_tlv(&[0x5F, 0x01], b"0107"),
                encode_tlv(&[0x5F, 0x36], b"040000"),
                encode_tlv(&[0x5C], tags),
            ]
            .concat(),
        )
    }

    /// A BAC passport with DG1, DG2, DG14 and DG15 signed by `pki`.
    fn passport(pki: &TestPki) -> VirtualPassport {
        let (ca_key, spki) = ec_key_pair();
        let dg14 = chip_authentication_dg14(&spki, None);
        let dg15 = encode_tlv(&[0x6F], &rsa_pkey().public_key_to_der().unwrap());
        let sod_content = lds_security_object(&[(1, &dg1()), (2, &DG2), (14, &dg14), (15, &dg15)]);
        let sod = encode_tlv(
            &[0x77],
            &signed_data("2.23.136.1.1.1", &sod_content, &pki.ds, &pki.ds_key, &[]),
        );
        VirtualPassport::new(MRZ_KEY)
            .with_chip_authentication_key(ca_key)
            .with_data_group(DataGroupId::Com, ef_com(&hex!("61756E6F")))
            .with_data_group(DataGroupId::Sod, sod)
            .with_data_group(DataGroupId::Dg1, dg1())
            .with_data_group(DataGroupId::Dg2, DG2.to_vec())
            .with_data_group(DataGroupId::Dg14, dg14)
            .with_data_group(DataGroupId::Dg15, dg15)
    }

    fn trusting(pki: &TestPki) -> TrustStore {
        let mut store = TrustStore::new();
        store.add_certificate(pki.csca.clone());
        store
    }

    #[test]
    fn test_full_read() {
        let pki = TestPki::new();
        let chip = passport(&pki);
        let log = chip.log();
        let mut comms = EmrtdComms::<VirtualPassport, MockRng>::new(chip);

        let outcome = PassportReader::default().read(&mut comms, &seed(), &trusting(&pki), &CancellationToken::new());
        assert!(outcome.error.is_none(), "{:?}", outcome.error);
        let passport = outcome.passport;
        let status = &passport.verification;
        assert_eq!(status.bac.verdict, Verdict::Succeeded);
        assert_eq!(status.sac.verdict, Verdict::NotPresent);
        assert!(status.ca.is_succeeded(), "{}", status.ca);
        assert!(status.passive_authentication_succeeded(), "{status}");
        assert_eq!(status.aa.verdict, Verdict::Succeeded);
        assert_eq!(status.eac.verdict, Verdict::NotPresent);

        let report = status.passive_auth.as_ref().unwrap();
        assert_eq!(report.data_group_hashes[&DataGroupId::Dg14], HashCheck::Matched);
        assert_eq!(report.data_group_hashes[&DataGroupId::Dg15], HashCheck::Matched);

        assert_eq!(passport.access_protocol, Some(AccessProtocol::Bac));
        assert_eq!(passport.export()["surname"], "ERIKSSON");
        assert!(passport.active_authentication.is_some());
        assert!(passport.data_groups.is_absent(DataGroupId::Dg11));
        assert_eq!(passport.features.ca, FeaturePresence::Present);
        assert_eq!(passport.features.aa, FeaturePresence::Present);
        assert_eq!(passport.features.bac, FeaturePresence::Present);
        assert!(log.borrow().iter().any(|command| command.starts_with(&hex!("0C880000"))));
    }

    #[test]
    fn test_wrong_mrz_stops_before_reading() {
        let pki = TestPki::new();
        let chip = passport(&pki);
        let log = chip.log();
        let mut comms = EmrtdComms::<VirtualPassport, MockRng>::new(chip);
        let wrong = MrzSeed::new("L898902C", "690806", "940624").unwrap();

        let outcome = PassportReader::default().read(&mut comms, &wrong, &trusting(&pki), &CancellationToken::new());
        assert!(matches!(outcome.error, Some(ChipError::AccessDenied(_))), "{:?}", outcome.error);
        assert_eq!(outcome.passport.verification.bac.verdict, Verdict::Failed);
        assert!(outcome.passport.data_groups.is_empty());
        // Nothing was read with READ BINARY after the refused EXTERNAL AUTHENTICATE
        let sent = log.borrow();
        let refused = sent.iter().position(|command| command.starts_with(&hex!("0082"))).unwrap();
        assert!(sent[refused..].iter().all(|command| command[1] != 0xB0));
    }

    #[test]
    fn test_cancelled_read_keeps_partial_data() {
        let pki = TestPki::new();
        let mut comms = EmrtdComms::<VirtualPassport, MockRng>::new(passport(&pki));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = PassportReader::default().read(&mut comms, &seed(), &trusting(&pki), &cancel);
        assert!(matches!(outcome.error, Some(ChipError::Cancelled)));
        assert!(outcome.passport.data_groups.is_empty());
        assert_eq!(outcome.passport.verification.ht.verdict, Verdict::Unknown);
    }

    #[test]
    fn test_unprotected_chip_with_verifications_disabled() {
        let pki = TestPki::new();
        let mut comms = EmrtdComms::<VirtualPassport, MockRng>::new(passport(&pki).without_access_control());
        let config = ReaderConfig {
            chip_authentication: false,
            active_authentication: false,
            passive_authentication: false,
            read_dg15: false,
            ..ReaderConfig::default()
        };

        let outcome = PassportReader::new(config).read(&mut comms, &seed(), &TrustStore::new(), &CancellationToken::new());
        assert!(outcome.error.is_none(), "{:?}", outcome.error);
        let status = &outcome.passport.verification;
        assert_eq!(status.bac.verdict, Verdict::NotPresent);
        assert_eq!(status.ca.verdict, Verdict::NotChecked);
        assert_eq!(status.ht.verdict, Verdict::NotChecked);
        assert_eq!(status.aa.verdict, Verdict::NotPresent);
        assert!(outcome.passport.ef_com.is_some());
        assert!(!outcome.passport.data_groups.contains(DataGroupId::Dg15));
        assert_eq!(outcome.passport.access_protocol, None);
    }
}
