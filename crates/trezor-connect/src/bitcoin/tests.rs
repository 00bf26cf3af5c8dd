use std::sync::Arc;

use hw_codec::RawMessage;

use super::*;
use crate::messages::{
    ButtonAck, ButtonRequest, Failure, TxRequestDetails, TxRequestSerialized,
};
use crate::registry::MessageRegistry;
use crate::testing::{reply, MockDevice};
use crate::transport::Transport;

const BTC_SIGN_P2PKH: &str = include_str!("../../../../tests/data/bitcoin/btc_sign_p2pkh.json");
const BTC_REF_TXS: &str = include_str!("../../../../tests/data/bitcoin/btc_ref_txs.json");
const BTC_OPTION_NOT_NUMERIC: &str =
    include_str!("../../../../tests/data/bitcoin/btc_option_not_numeric.json");

const PREV_HASH: &str = "e5040e1bc1ae7667ffb9e5248e90b2fb93cd9150234151ce90e14ab2f5933bcd";

fn fixture() -> (BitcoinTx, Vec<RefTransaction>) {
    (
        BitcoinTx::from_json(BTC_SIGN_P2PKH).expect("tx fixture"),
        RefTransaction::list_from_json(BTC_REF_TXS).expect("ref fixture"),
    )
}

fn prev_hash_bytes() -> Vec<u8> {
    ::hex::decode(PREV_HASH).unwrap()
}

fn tx_request(kind: RequestType, index: Option<u32>, tx_hash: Option<Vec<u8>>) -> TxRequest {
    TxRequest {
        request_type: Some(kind as i32),
        details: Some(TxRequestDetails {
            request_index: index,
            tx_hash,
            extra_data_len: None,
            extra_data_offset: None,
        }),
        serialized: None,
    }
}

fn with_serialized(
    mut request: TxRequest,
    signature: Option<(u32, Vec<u8>)>,
    serialized_tx: Option<Vec<u8>>,
) -> TxRequest {
    request.serialized = Some(TxRequestSerialized {
        signature_index: signature.as_ref().map(|(index, _)| *index),
        signature: signature.map(|(_, signature)| signature),
        serialized_tx,
    });
    request
}

fn session_for(device: &MockDevice) -> DeviceSession<MockDevice> {
    DeviceSession::with_transport(Transport::new(device.clone()), MessageRegistry::trezor())
}

fn ack_payload(step: TxRequestStep) -> TransactionType {
    match step {
        TxRequestStep::Ack(tx) => tx,
        TxRequestStep::Finished => panic!("expected ack"),
    }
}

// ── payload computation ──────────────────────────────────────────────────────

#[test]
fn current_input_is_sent_with_configured_hash_order() {
    let (tx, refs) = fixture();

    let prepared = prepare(&tx, &refs, PrevHashOrder::AsGiven).unwrap();
    let ack = ack_payload(
        answer_tx_request(&prepared, &tx_request(RequestType::TxInput, Some(0), None)).unwrap(),
    );
    assert_eq!(ack.inputs.len(), 1);
    assert_eq!(ack.inputs[0].prev_hash, prev_hash_bytes());
    assert_eq!(ack.inputs[0].prev_index, 0);
    assert_eq!(ack.inputs[0].sequence, Some(0xffff_ffff));
    assert_eq!(
        ack.inputs[0].script_type,
        Some(InputScriptType::SpendAddress as i32)
    );

    let prepared = prepare(&tx, &refs, PrevHashOrder::Reversed).unwrap();
    let ack = ack_payload(
        answer_tx_request(&prepared, &tx_request(RequestType::TxInput, Some(0), None)).unwrap(),
    );
    assert_eq!(ack.inputs[0].prev_hash, reversed(&prev_hash_bytes()));
}

#[test]
fn reversed_order_resolves_echoed_ref_hash() {
    let (tx, refs) = fixture();
    let prepared = prepare(&tx, &refs, PrevHashOrder::Reversed).unwrap();
    let wire_hash = reversed(&prev_hash_bytes());

    let ack = ack_payload(
        answer_tx_request(
            &prepared,
            &tx_request(RequestType::TxOutput, Some(0), Some(wire_hash)),
        )
        .unwrap(),
    );
    assert_eq!(ack.bin_outputs[0].amount, 390_000);
}

#[test]
fn ref_tx_requests_are_answered_from_the_ref_map() {
    let (tx, refs) = fixture();
    let prepared = prepare(&tx, &refs, PrevHashOrder::AsGiven).unwrap();

    let meta = ack_payload(
        answer_tx_request(
            &prepared,
            &tx_request(RequestType::TxMeta, None, Some(prev_hash_bytes())),
        )
        .unwrap(),
    );
    assert_eq!(meta.version, Some(1));
    assert_eq!(meta.lock_time, Some(0));
    assert_eq!(meta.inputs_cnt, Some(1));
    assert_eq!(meta.outputs_cnt, Some(1));
    assert_eq!(meta.extra_data_len, None);

    let input = ack_payload(
        answer_tx_request(
            &prepared,
            &tx_request(RequestType::TxInput, Some(0), Some(prev_hash_bytes())),
        )
        .unwrap(),
    );
    assert_eq!(input.inputs[0].prev_index, 1);
    assert_eq!(
        input.inputs[0].script_sig.as_ref().map(|script| script[0]),
        Some(0x48)
    );

    let output = ack_payload(
        answer_tx_request(
            &prepared,
            &tx_request(RequestType::TxOutput, Some(0), Some(prev_hash_bytes())),
        )
        .unwrap(),
    );
    assert_eq!(
        ::hex::encode(&output.bin_outputs[0].script_pubkey),
        "76a91424a56db43cf6f2b02e838ea493f95d8d6047423188ac"
    );
}

#[test]
fn extra_data_is_sliced_by_offset_and_length() {
    let (tx, mut refs) = fixture();
    refs[0].extra_data = Some("00112233445566778899".into());
    refs[0].version_group_id = Some(0x892f_2085);
    let prepared = prepare(&tx, &refs, PrevHashOrder::AsGiven).unwrap();

    let meta = ack_payload(
        answer_tx_request(
            &prepared,
            &tx_request(RequestType::TxMeta, None, Some(prev_hash_bytes())),
        )
        .unwrap(),
    );
    assert_eq!(meta.extra_data_len, Some(10));
    assert_eq!(meta.version_group_id, Some(0x892f_2085));

    let mut request = tx_request(RequestType::TxExtraData, None, Some(prev_hash_bytes()));
    if let Some(details) = request.details.as_mut() {
        details.extra_data_offset = Some(2);
        details.extra_data_len = Some(3);
    }
    let chunk = ack_payload(answer_tx_request(&prepared, &request).unwrap());
    assert_eq!(chunk.extra_data, Some(vec![0x22, 0x33, 0x44]));

    if let Some(details) = request.details.as_mut() {
        details.extra_data_offset = Some(8);
    }
    assert!(matches!(
        answer_tx_request(&prepared, &request),
        Err(DeviceError::Protocol(_))
    ));
}

#[test]
fn unknown_ref_hash_fails() {
    let (tx, refs) = fixture();
    let prepared = prepare(&tx, &refs, PrevHashOrder::AsGiven).unwrap();

    let err = answer_tx_request(
        &prepared,
        &tx_request(RequestType::TxMeta, None, Some(vec![0x11; 32])),
    )
    .unwrap_err();
    match err {
        DeviceError::UnknownTx(hash) => assert_eq!(hash, "11".repeat(32)),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn meta_for_current_tx_is_a_protocol_violation() {
    let (tx, refs) = fixture();
    let prepared = prepare(&tx, &refs, PrevHashOrder::AsGiven).unwrap();

    for kind in [RequestType::TxMeta, RequestType::TxExtraData] {
        let err = answer_tx_request(&prepared, &tx_request(kind, Some(0), None)).unwrap_err();
        assert!(matches!(err, DeviceError::Protocol(_)));
    }
    let err = answer_tx_request(&prepared, &tx_request(RequestType::TxOutput, Some(3), None))
        .unwrap_err();
    assert!(matches!(err, DeviceError::Protocol(_)));
}

#[test]
fn finished_needs_no_payload() {
    let (tx, refs) = fixture();
    let prepared = prepare(&tx, &refs, PrevHashOrder::AsGiven).unwrap();
    let request = TxRequest {
        request_type: Some(RequestType::TxFinished as i32),
        details: None,
        serialized: None,
    };
    assert_eq!(
        answer_tx_request(&prepared, &request).unwrap(),
        TxRequestStep::Finished
    );
}

// ── validation ───────────────────────────────────────────────────────────────

fn simple_tx(amount: &str) -> BitcoinTx {
    BitcoinTx {
        coin_name: "Bitcoin".into(),
        inputs: vec![TxInput {
            address_n: vec![0x8000_002c, 0x8000_0000, 0x8000_0000, 0, 0],
            prev_hash: Some(PREV_HASH.into()),
            prev_index: Some(0),
            ..Default::default()
        }],
        outputs: vec![TxOutput {
            address: Some("1MJ2tj2ThBE62zXbBYA5ZaN3fdve5CPAz1".into()),
            amount: amount.into(),
            ..Default::default()
        }],
        ..Default::default()
    }
}

fn invalid_message(result: Result<PreparedTx>) -> String {
    match result {
        Err(DeviceError::InvalidParam(message)) => message,
        Err(other) => panic!("unexpected error: {other:?}"),
        Ok(_) => panic!("expected validation error"),
    }
}

#[test]
fn dust_limit_is_a_strict_boundary() {
    let message = invalid_message(prepare(&simple_tx("546"), &[], PrevHashOrder::AsGiven));
    assert!(message.contains("dust limit 546"));
    assert!(prepare(&simple_tx("547"), &[], PrevHashOrder::AsGiven).is_ok());

    let mut litecoin = simple_tx("54600");
    litecoin.coin_name = "Litecoin".into();
    assert!(prepare(&litecoin, &[], PrevHashOrder::AsGiven).is_err());
}

#[test]
fn op_return_outputs_do_not_count_toward_dust() {
    let mut tx = simple_tx("500");
    tx.outputs.push(TxOutput {
        amount: "100".into(),
        op_return_data: Some("deadbeef".into()),
        ..Default::default()
    });
    assert!(prepare(&tx, &[], PrevHashOrder::AsGiven).is_err());

    tx.outputs[0].amount = "600".into();
    let prepared = prepare(&tx, &[], PrevHashOrder::AsGiven).unwrap();
    assert_eq!(
        prepared.outputs[1].script_type,
        Some(OutputScriptType::PayToOpReturn as i32)
    );
}

#[test]
fn output_needs_exactly_one_destination() {
    let mut tx = simple_tx("1000");
    tx.outputs[0].address_n = Some(vec![0x8000_002c, 0x8000_0000, 0x8000_0000, 1, 0]);
    let message = invalid_message(prepare(&tx, &[], PrevHashOrder::AsGiven));
    assert!(message.contains("both address and address_n"));

    tx.outputs[0].address = None;
    assert!(prepare(&tx, &[], PrevHashOrder::AsGiven).is_ok());

    tx.outputs[0].address_n = None;
    let message = invalid_message(prepare(&tx, &[], PrevHashOrder::AsGiven));
    assert!(message.contains("requires either address or address_n"));
}

#[test]
fn inputs_need_prev_outpoint_and_segwit_amount() {
    let mut tx = simple_tx("1000");
    tx.inputs[0].prev_hash = None;
    assert!(invalid_message(prepare(&tx, &[], PrevHashOrder::AsGiven)).contains("prev_hash"));

    let mut tx = simple_tx("1000");
    tx.inputs[0].prev_index = None;
    assert!(invalid_message(prepare(&tx, &[], PrevHashOrder::AsGiven)).contains("prev_index"));

    let mut tx = simple_tx("1000");
    tx.inputs[0].address_n = vec![0x8000_0054, 0x8000_0000, 0x8000_0000, 0, 0];
    assert!(invalid_message(prepare(&tx, &[], PrevHashOrder::AsGiven)).contains("requires amount"));

    tx.inputs[0].amount = Some("2000".into());
    let prepared = prepare(&tx, &[], PrevHashOrder::AsGiven).unwrap();
    assert_eq!(prepared.inputs[0].amount, Some(2000));
    assert_eq!(
        prepared.inputs[0].script_type,
        Some(InputScriptType::SpendWitness as i32)
    );
}

#[test]
fn rejects_empty_lists_unknown_coin_and_duplicate_refs() {
    let mut tx = simple_tx("1000");
    tx.inputs.clear();
    assert!(invalid_message(prepare(&tx, &[], PrevHashOrder::AsGiven)).contains("input"));

    let mut tx = simple_tx("1000");
    tx.outputs.clear();
    assert!(invalid_message(prepare(&tx, &[], PrevHashOrder::AsGiven)).contains("output"));

    let mut tx = simple_tx("1000");
    tx.coin_name = "Nocoin".into();
    assert!(invalid_message(prepare(&tx, &[], PrevHashOrder::AsGiven)).contains("unknown coin"));

    let (tx, refs) = fixture();
    let mut duplicated = refs.clone();
    let mut upper = refs[0].clone();
    upper.hash = upper.hash.to_ascii_uppercase();
    duplicated.push(upper);
    assert!(
        invalid_message(prepare(&tx, &duplicated, PrevHashOrder::AsGiven))
            .contains("duplicate ref_txs hash")
    );
}

#[test]
fn options_must_be_numeric() {
    let tx = BitcoinTx::from_json(BTC_SIGN_P2PKH).unwrap();
    assert_eq!(tx.version, Some(2));

    let err = BitcoinTx::from_json(BTC_OPTION_NOT_NUMERIC).unwrap_err();
    assert!(matches!(err, DeviceError::InvalidParam(_)));
}

#[test]
fn witness_inputs_need_a_segwit_coin() {
    let mut tx = simple_tx("20000000");
    tx.coin_name = "Dogecoin".into();
    tx.inputs[0].address_n = vec![0x8000_0054, 0x8000_0003, 0x8000_0000, 0, 0];
    tx.inputs[0].amount = Some("30000000".into());
    assert!(invalid_message(prepare(&tx, &[], PrevHashOrder::AsGiven)).contains("Dogecoin"));

    tx.coin_name = "Litecoin".into();
    assert!(prepare(&tx, &[], PrevHashOrder::AsGiven).is_ok());
}

#[test]
fn serialized_fragments_accumulate_and_check_signature_index() {
    let mut serialized_tx = vec![0x01];
    let mut signatures = vec![None, None];
    let request = with_serialized(
        tx_request(RequestType::TxInput, Some(0), None),
        Some((1, vec![0x30])),
        Some(vec![0x02]),
    );
    collect_serialized(&request, &mut serialized_tx, &mut signatures).unwrap();
    assert_eq!(serialized_tx, vec![0x01, 0x02]);
    assert_eq!(signatures, vec![None, Some(vec![0x30])]);

    let out_of_range = with_serialized(
        tx_request(RequestType::TxInput, Some(0), None),
        Some((2, vec![0x30])),
        None,
    );
    match collect_serialized(&out_of_range, &mut serialized_tx, &mut signatures) {
        Err(DeviceError::Protocol(message)) => assert!(message.contains("for 2 inputs")),
        other => panic!("unexpected result: {other:?}"),
    }
}

#[test]
fn signer_takes_hash_order_from_config() {
    let config = crate::config::SessionConfig::from_json(r#"{"prev_hash_order": "reversed"}"#)
        .unwrap();
    let signer = BitcoinSigner::from_config(&config);
    assert_eq!(signer.prev_hash_order, PrevHashOrder::Reversed);
    assert_eq!(
        BitcoinSigner::from_config(&Default::default()).prev_hash_order,
        PrevHashOrder::AsGiven
    );
}

// ── full exchange ────────────────────────────────────────────────────────────

fn device_request(request: TxRequest) -> RawMessage {
    reply(&request)
}

fn script_p2pkh_signing(device: &MockDevice) {
    let hash = prev_hash_bytes();
    device
        .on::<SignTx>(vec![device_request(tx_request(
            RequestType::TxInput,
            Some(0),
            None,
        ))])
        .on::<TxAck>(vec![device_request(tx_request(
            RequestType::TxMeta,
            None,
            Some(hash.clone()),
        ))])
        .on::<TxAck>(vec![device_request(tx_request(
            RequestType::TxInput,
            Some(0),
            Some(hash.clone()),
        ))])
        .on::<TxAck>(vec![device_request(tx_request(
            RequestType::TxOutput,
            Some(0),
            Some(hash),
        ))])
        .on::<TxAck>(vec![device_request(tx_request(
            RequestType::TxOutput,
            Some(0),
            None,
        ))])
        .on::<TxAck>(vec![reply(&ButtonRequest {
            code: Some(8),
            pages: None,
        })])
        .on::<ButtonAck>(vec![device_request(with_serialized(
            tx_request(RequestType::TxInput, Some(0), None),
            None,
            Some(vec![0xab]),
        ))])
        .on::<TxAck>(vec![device_request(with_serialized(
            tx_request(RequestType::TxOutput, Some(0), None),
            Some((0, vec![0x30, 0x44])),
            Some(vec![0xcd]),
        ))])
        .on::<TxAck>(vec![device_request(with_serialized(
            TxRequest {
                request_type: Some(RequestType::TxFinished as i32),
                details: None,
                serialized: None,
            },
            None,
            Some(vec![0xef]),
        ))]);
}

#[tokio::test]
async fn signs_p2pkh_transaction_end_to_end() {
    crate::testing::init_tracing();
    let device = MockDevice::default();
    script_p2pkh_signing(&device);
    let mut session = session_for(&device);
    let (tx, refs) = fixture();
    let signer = BitcoinSigner::default();

    let signed = signer.sign_tx(&mut session, &tx, &refs).await.expect("sign");
    assert_eq!(signed.serialized_hex(), "abcdef");
    assert_eq!(signed.signatures, vec![Some(vec![0x30, 0x44])]);
    assert!(device.script_exhausted());
    assert_eq!(signer.state(), SignerState::Idle);

    let sign_tx: SignTx = device.received_as(0);
    assert_eq!(sign_tx.inputs_count, 1);
    assert_eq!(sign_tx.outputs_count, 1);
    assert_eq!(sign_tx.coin_name.as_deref(), Some("Bitcoin"));
    assert_eq!(sign_tx.version, Some(2));

    let meta_ack: TxAck = device.received_as(1);
    let meta = meta_ack.tx.expect("tx");
    assert_eq!(meta.inputs_cnt, Some(1));
    assert_eq!(meta.outputs_cnt, Some(1));

    let first_ack: TxAck = device.received_as(0);
    assert_eq!(first_ack.tx.expect("tx").inputs[0].prev_hash, prev_hash_bytes());
}

#[tokio::test]
async fn unknown_ref_tx_aborts_before_any_ack() {
    let device = MockDevice::default();
    device.on::<SignTx>(vec![device_request(tx_request(
        RequestType::TxMeta,
        None,
        Some(vec![0x22; 32]),
    ))]);
    let mut session = session_for(&device);
    let (tx, refs) = fixture();
    let signer = BitcoinSigner::default();

    let err = signer.sign_tx(&mut session, &tx, &refs).await.unwrap_err();
    assert!(err.to_string().starts_with("unknown tx requested"));
    assert_eq!(device.received_names(), vec!["SignTx"]);
    assert_eq!(signer.state(), SignerState::Idle);
}

#[tokio::test]
async fn validation_failure_never_reaches_the_device() {
    let device = MockDevice::default();
    let mut session = session_for(&device);
    let signer = BitcoinSigner::default();

    let err = signer
        .sign_tx(&mut session, &simple_tx("10"), &[])
        .await
        .unwrap_err();
    assert!(matches!(err, DeviceError::InvalidParam(_)));
    assert!(device.received().is_empty());
    assert_eq!(signer.state(), SignerState::Idle);
}

#[tokio::test]
async fn device_failure_rejects_the_operation() {
    struct Events(parking_lot::Mutex<usize>);

    #[async_trait::async_trait]
    impl crate::session::PromptHandler for Events {
        fn on_event(&self, _event: &crate::session::DeviceEvent) {
            *self.0.lock() += 1;
        }

        async fn on_prompt(
            &self,
            _prompt: crate::session::DevicePrompt,
        ) -> std::result::Result<crate::session::PromptReply, String> {
            Err("unused".into())
        }
    }

    let device = MockDevice::default();
    device
        .on::<SignTx>(vec![device_request(tx_request(
            RequestType::TxInput,
            Some(0),
            None,
        ))])
        .on::<TxAck>(vec![reply(&Failure {
            code: Some(4),
            message: Some("Action cancelled by user".into()),
        })]);
    let events = Arc::new(Events(parking_lot::Mutex::new(0)));
    let mut session = session_for(&device);
    session.set_prompt_handler(events.clone());
    let (tx, refs) = fixture();
    let signer = BitcoinSigner::default();

    let err = signer.sign_tx(&mut session, &tx, &refs).await.unwrap_err();
    assert!(matches!(err, DeviceError::DeviceFailure { code: Some(4), .. }));
    assert_eq!(*events.0.lock(), 0);
    assert_eq!(signer.state(), SignerState::Idle);
}

#[tokio::test]
async fn concurrent_sign_is_rejected_as_busy() {
    let first_device = MockDevice::default();
    script_p2pkh_signing(&first_device);
    let second_device = MockDevice::default();
    let mut first = session_for(&first_device);
    let mut second = session_for(&second_device);
    let (tx, refs) = fixture();
    let signer = BitcoinSigner::default();

    let (first_result, second_result) = tokio::join!(
        signer.sign_tx(&mut first, &tx, &refs),
        signer.sign_tx(&mut second, &tx, &refs),
    );

    assert!(matches!(second_result, Err(DeviceError::Busy)));
    assert!(second_device.received().is_empty());
    let signed = first_result.expect("first sign");
    assert_eq!(signed.serialized_hex(), "abcdef");
    assert_eq!(signer.state(), SignerState::Idle);
}
