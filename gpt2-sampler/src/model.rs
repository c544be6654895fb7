//! Inference backends for the sampling loop.

use std::path::Path;

use ndarray::{Array3, ArrayD, ArrayView1, ArrayView2, Ix3, IxDyn};
use tract_onnx::prelude::*;
use tracing::info;

use crate::error::{Error, Result};

/// Name of the graph input carrying token ids, shape (batch, len).
pub const INPUT_IDS: &str = "input_ids";
/// Name of the graph input carrying position indices, shape (len).
pub const POSITION_IDS: &str = "position_ids";

/// A network mapping token ids and positions to next-token logits.
pub trait LanguageModel {
    /// Run the full sequence and return logits of shape (batch, len, vocab).
    fn forward(
        &mut self,
        input_ids: ArrayView2<'_, i64>,
        position_ids: ArrayView1<'_, i64>,
    ) -> Result<Array3<f32>>;
}

/// Model backed by a closure, see [`from_fn`].
pub struct FnModel<F>(F);

/// Wrap an inference callable as a [`LanguageModel`].
pub fn from_fn<F>(f: F) -> FnModel<F>
where
    F: FnMut(ArrayView2<'_, i64>, ArrayView1<'_, i64>) -> Result<Array3<f32>>,
{
    FnModel(f)
}

impl<F> LanguageModel for FnModel<F>
where
    F: FnMut(ArrayView2<'_, i64>, ArrayView1<'_, i64>) -> Result<Array3<f32>>,
{
    fn forward(
        &mut self,
        input_ids: ArrayView2<'_, i64>,
        position_ids: ArrayView1<'_, i64>,
    ) -> Result<Array3<f32>> {
        (self.0)(input_ids, position_ids)
    }
}

/// GPT-2 graph exported to ONNX, executed with tract.
///
/// The export may pin the sequence length; such a graph only accepts
/// prompts of that length and fails at the first forward pass otherwise.
pub struct OnnxModel {
    plan: TypedRunnableModel<TypedModel>,
    ids_slot: usize,
    ids_type: DatumType,
    positions_type: DatumType,
}

impl OnnxModel {
    /// Parse, optimize and plan the graph stored at `path`.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(Error::ModelLoad(format!("{} is not a file", path.display())));
        }
        let model = tract_onnx::onnx()
            .model_for_path(path)
            .and_then(|m| m.into_optimized())
            .map_err(|e| Error::ModelLoad(format!("{}: {e:#}", path.display())))?;

        let outlets = model
            .input_outlets()
            .map_err(|e| Error::ModelLoad(format!("{e:#}")))?
            .to_vec();
        let names: Vec<String> = outlets
            .iter()
            .map(|o| model.node(o.node).name.clone())
            .collect();
        if names.len() != 2 {
            return Err(Error::ModelIncompatible(format!(
                "expected inputs [{INPUT_IDS}, {POSITION_IDS}], graph has {names:?}"
            )));
        }
        let slot = |wanted: &str| {
            names.iter().position(|n| n == wanted).ok_or_else(|| {
                Error::ModelIncompatible(format!("graph has no input named {wanted}, found {names:?}"))
            })
        };
        let ids_slot = slot(INPUT_IDS)?;
        let positions_slot = slot(POSITION_IDS)?;

        let input_type = |i: usize| -> Result<DatumType> {
            let fact = model
                .input_fact(i)
                .map_err(|e| Error::ModelIncompatible(format!("{e:#}")))?;
            match fact.datum_type {
                dt @ (DatumType::I32 | DatumType::I64) => Ok(dt),
                other => Err(Error::ModelIncompatible(format!(
                    "input {} has element type {other:?}, expected an integer type",
                    names[i]
                ))),
            }
        };
        let ids_type = input_type(ids_slot)?;
        let positions_type = input_type(positions_slot)?;

        let plan = model
            .into_runnable()
            .map_err(|e| Error::ModelLoad(format!("{e:#}")))?;
        info!(path = %path.display(), ?ids_type, ?positions_type, "loaded onnx model");

        Ok(Self {
            plan,
            ids_slot,
            ids_type,
            positions_type,
        })
    }
}

fn to_tensor(shape: &[usize], values: Vec<i64>, dt: DatumType) -> Result<Tensor> {
    let tensor = Tensor::from_shape(shape, values.as_slice())
        .map_err(|e| Error::Inference(format!("{e:#}")))?;
    let cast = tensor
        .cast_to_dt(dt)
        .map_err(|e| Error::Inference(format!("{e:#}")))?
        .into_owned();
    Ok(cast)
}

impl LanguageModel for OnnxModel {
    fn forward(
        &mut self,
        input_ids: ArrayView2<'_, i64>,
        position_ids: ArrayView1<'_, i64>,
    ) -> Result<Array3<f32>> {
        let (batch, len) = input_ids.dim();
        let ids = to_tensor(
            &[batch, len],
            input_ids.iter().copied().collect(),
            self.ids_type,
        )?;
        let positions = to_tensor(
            &[position_ids.len()],
            position_ids.to_vec(),
            self.positions_type,
        )?;
        let inputs: TVec<TValue> = if self.ids_slot == 0 {
            tvec!(TValue::from(ids), TValue::from(positions))
        } else {
            tvec!(TValue::from(positions), TValue::from(ids))
        };

        let outputs = self
            .plan
            .run(inputs)
            .map_err(|e| Error::Inference(format!("{e:#}")))?;
        let output = outputs
            .first()
            .ok_or_else(|| Error::Inference("graph produced no outputs".into()))?;
        let logits = output
            .cast_to::<f32>()
            .map_err(|e| Error::Inference(format!("{e:#}")))?;
        let view = logits
            .to_array_view::<f32>()
            .map_err(|e| Error::Inference(format!("{e:#}")))?;

        let shape = view.shape().to_vec();
        let logits = ArrayD::from_shape_vec(IxDyn(&shape), view.iter().copied().collect())
            .map_err(|e| Error::Inference(e.to_string()))?;
        logits
            .into_dimensionality::<Ix3>()
            .map_err(|_| Error::RankMismatch {
                expected: 3,
                got: shape,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;
    use std::io::Write;
    use tempfile::NamedTempFile;
    use tract_onnx::pb::attribute_proto::AttributeType;
    use tract_onnx::pb::tensor_proto::DataType;
    use tract_onnx::pb::tensor_shape_proto::{dimension, Dimension};
    use tract_onnx::pb::{
        type_proto, AttributeProto, GraphProto, ModelProto, NodeProto, OperatorSetIdProto,
        TensorProto, TensorShapeProto, TypeProto, ValueInfoProto,
    };

    const VOCAB: usize = 60;

    fn value_info(name: &str, elem_type: DataType, dims: &[&str]) -> ValueInfoProto {
        let dim = dims
            .iter()
            .map(|d| Dimension {
                value: Some(dimension::Value::DimParam(d.to_string())),
                ..Default::default()
            })
            .collect();
        ValueInfoProto {
            name: name.to_string(),
            r#type: Some(TypeProto {
                value: Some(type_proto::Value::TensorType(type_proto::Tensor {
                    elem_type: elem_type as i32,
                    shape: Some(TensorShapeProto { dim }),
                })),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn node(op: &str, inputs: &[&str], output: &str, attribute: Vec<AttributeProto>) -> NodeProto {
        NodeProto {
            input: inputs.iter().map(|s| s.to_string()).collect(),
            output: vec![output.to_string()],
            name: output.to_string(),
            op_type: op.to_string(),
            attribute,
            ..Default::default()
        }
    }

    /// Graph computing `logits[b, t, v] = (ids[b, t] + pos[t]) * 0.01 * v`.
    ///
    /// `inputs` lists the declared graph inputs in order; a graph declaring
    /// only `input_ids` skips the addition. With `rank3 == false` the
    /// output keeps shape (batch, len).
    fn toy_graph(inputs: &[&str], elem_type: DataType, rank3: bool) -> ModelProto {
        let input = inputs
            .iter()
            .map(|&name| {
                let dims: &[&str] = if name == POSITION_IDS { &["seq"] } else { &["batch", "seq"] };
                value_info(name, elem_type, dims)
            })
            .collect();

        let mut nodes = Vec::new();
        let summed = if inputs.len() == 2 {
            nodes.push(node("Add", &[INPUT_IDS, POSITION_IDS], "summed", vec![]));
            "summed"
        } else {
            INPUT_IDS
        };
        nodes.push(node(
            "Cast",
            &[summed],
            "as_float",
            vec![AttributeProto {
                name: "to".into(),
                r#type: AttributeType::Int as i32,
                i: DataType::Float as i64,
                ..Default::default()
            }],
        ));

        let mut initializer = Vec::new();
        let output = if rank3 {
            nodes.push(node(
                "Unsqueeze",
                &["as_float"],
                "expanded",
                vec![AttributeProto {
                    name: "axes".into(),
                    r#type: AttributeType::Ints as i32,
                    ints: vec![2],
                    ..Default::default()
                }],
            ));
            initializer.push(TensorProto {
                name: "scale".into(),
                dims: vec![VOCAB as i64],
                data_type: DataType::Float as i32,
                float_data: (0..VOCAB).map(|v| v as f32 * 0.01).collect(),
                ..Default::default()
            });
            nodes.push(node("Mul", &["expanded", "scale"], "logits", vec![]));
            value_info("logits", DataType::Float, &["batch", "seq", "vocab"])
        } else {
            value_info("as_float", DataType::Float, &["batch", "seq"])
        };

        ModelProto {
            ir_version: 7,
            opset_import: vec![OperatorSetIdProto {
                domain: String::new(),
                version: 11,
            }],
            graph: Some(GraphProto {
                name: "toy".into(),
                node: nodes,
                initializer,
                input,
                output: vec![output],
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn write_graph(graph: &ModelProto) -> std::io::Result<NamedTempFile> {
        let mut file = tempfile::Builder::new().suffix(".onnx").tempfile()?;
        file.write_all(&graph.encode_to_vec())?;
        Ok(file)
    }

    #[test]
    fn missing_file_fails_to_load() {
        let err = OnnxModel::load("/nonexistent/gpt2.onnx").err().unwrap();
        assert!(matches!(err, Error::ModelLoad(_)));
    }

    #[test]
    fn garbage_file_fails_to_load() -> std::io::Result<()> {
        let mut file = NamedTempFile::new()?;
        file.write_all(b"definitely not a protobuf graph")?;
        let err = OnnxModel::load(file.path()).err().unwrap();
        assert!(matches!(err, Error::ModelLoad(_)));
        Ok(())
    }

    #[test]
    fn closure_model_sees_inputs() {
        let mut model = from_fn(|ids: ArrayView2<'_, i64>, pos: ArrayView1<'_, i64>| {
            assert_eq!(ids.ncols(), pos.len());
            Ok(Array3::from_elem((ids.nrows(), ids.ncols(), 4), 0.5))
        });
        let ids = ndarray::array![[1_i64, 2, 3]];
        let pos = ndarray::array![0_i64, 1, 2];
        let logits = model.forward(ids.view(), pos.view()).unwrap();
        assert_eq!(logits.dim(), (1, 3, 4));
    }

    #[test]
    fn inputs_bind_by_name_in_any_order() -> std::io::Result<()> {
        let file = write_graph(&toy_graph(&[POSITION_IDS, INPUT_IDS], DataType::Int64, true))?;
        let mut model = OnnxModel::load(file.path()).unwrap();

        let ids = ndarray::array![[1_i64, 2, 3], [4, 5, 6]];
        let pos = ndarray::array![0_i64, 1, 2];
        let logits = model.forward(ids.view(), pos.view()).unwrap();
        assert_eq!(logits.dim(), (2, 3, VOCAB));
        assert!((logits[[1, 2, 10]] - 0.8).abs() < 1e-5);
        assert!((logits[[0, 0, 59]] - 0.59).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn int32_inputs_are_cast() -> std::io::Result<()> {
        let file = write_graph(&toy_graph(&[INPUT_IDS, POSITION_IDS], DataType::Int32, true))?;
        let mut model = OnnxModel::load(file.path()).unwrap();
        assert_eq!(model.ids_type, DatumType::I32);
        assert_eq!(model.positions_type, DatumType::I32);

        let ids = ndarray::array![[7_i64, 8]];
        let pos = ndarray::array![0_i64, 1];
        let logits = model.forward(ids.view(), pos.view()).unwrap();
        assert_eq!(logits.dim(), (1, 2, VOCAB));
        assert!((logits[[0, 1, 1]] - 0.09).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn loaded_graph_drives_generation() -> std::io::Result<()> {
        let file = write_graph(&toy_graph(&[POSITION_IDS, INPUT_IDS], DataType::Int64, true))?;
        let mut model = OnnxModel::load(file.path()).unwrap();
        let config = crate::GenerateConfig::new()
            .with_max_length(6)
            .with_batch_size(2);
        let out = crate::Generator::new(config)
            .generate(&mut model, &[1, 2])
            .unwrap();
        assert_eq!(out.dim(), (2, 6));
        for row in out.outer_iter() {
            assert_eq!(row[0], 1);
            assert_eq!(row[1], 2);
        }
        Ok(())
    }

    #[test]
    fn missing_position_input_is_incompatible() -> std::io::Result<()> {
        let file = write_graph(&toy_graph(&[INPUT_IDS], DataType::Int64, true))?;
        let err = OnnxModel::load(file.path()).err().unwrap();
        assert!(matches!(err, Error::ModelIncompatible(_)), "got {err:?}");
        Ok(())
    }

    #[test]
    fn float_inputs_are_incompatible() -> std::io::Result<()> {
        let file = write_graph(&toy_graph(&[INPUT_IDS, POSITION_IDS], DataType::Float, true))?;
        let err = OnnxModel::load(file.path()).err().unwrap();
        assert!(matches!(err, Error::ModelIncompatible(_)), "got {err:?}");
        Ok(())
    }

    #[test]
    fn rank2_output_reports_rank() -> std::io::Result<()> {
        let file = write_graph(&toy_graph(&[INPUT_IDS, POSITION_IDS], DataType::Int64, false))?;
        let mut model = OnnxModel::load(file.path()).unwrap();

        let ids = ndarray::array![[1_i64, 2, 3]];
        let pos = ndarray::array![0_i64, 1, 2];
        match model.forward(ids.view(), pos.view()) {
            Err(Error::RankMismatch { expected, got }) => {
                assert_eq!(expected, 3);
                assert_eq!(got, vec![1, 3]);
            }
            Err(other) => panic!("unexpected error: {other:?}"),
            Ok(logits) => panic!("expected a rank error, got {:?}", logits.dim()),
        }
        Ok(())
    }
}
