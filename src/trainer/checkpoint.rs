//! Raw weight streams for model checkpoints: little-endian f32 records
//! tagged with the parameter name, sorted for determinism.

use std::{
    fs::File,
    io::{BufReader, BufWriter, Read, Write},
};

use crate::graph::{Function, GraphBuilder};

use super::TrainerError;

pub fn write_model(graph: &GraphBuilder, model: Function, path: &str) -> Result<(), TrainerError> {
    let mut params = graph.named_parameters(model);
    params.sort_by(|a, b| a.0.cmp(&b.0));

    let mut file = BufWriter::new(File::create(path)?);

    for (name, param) in params {
        let value = graph.value(param).unwrap();
        let vals = value.dense()?;

        file.write_all(&(name.len() as u32).to_le_bytes())?;
        file.write_all(name.as_bytes())?;
        file.write_all(&(vals.len() as u32).to_le_bytes())?;

        for &v in vals {
            file.write_all(&v.to_le_bytes())?;
        }
    }

    Ok(())
}

pub fn load_model(graph: &GraphBuilder, model: Function, path: &str) -> Result<(), TrainerError> {
    let mut file = BufReader::new(File::open(path)?);
    let params = graph.named_parameters(model);

    loop {
        let mut len_buf = [0u8; 4];
        match file.read_exact(&mut len_buf) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }

        let name_len = u32::from_le_bytes(len_buf) as usize;
        let mut name_buf = vec![0u8; name_len];
        file.read_exact(&mut name_buf)?;
        let name = String::from_utf8(name_buf)
            .map_err(|_| TrainerError::Checkpoint("weight record name is not utf-8".to_string()))?;

        file.read_exact(&mut len_buf)?;
        let count = u32::from_le_bytes(len_buf) as usize;

        let mut vals = vec![0.0f32; count];
        let mut val_buf = [0u8; 4];
        for v in vals.iter_mut() {
            file.read_exact(&mut val_buf)?;
            *v = f32::from_le_bytes(val_buf);
        }

        let Some((_, param)) = params.iter().find(|(n, _)| *n == name) else {
            return Err(TrainerError::Checkpoint(format!("no parameter named '{name}' in the model")));
        };

        if graph.shape(*param).size() != count {
            return Err(TrainerError::Checkpoint(format!(
                "weight record '{name}' holds {count} values, parameter expects {}",
                graph.shape(*param).size()
            )));
        }

        let mut failure = None;
        graph.update_parameter(*param, |value| match value.dense_mut() {
            Ok(buf) => buf.copy_from_slice(&vals),
            Err(e) => failure = Some(e),
        })?;

        if let Some(e) = failure {
            return Err(TrainerError::Eval(e.into()));
        }
    }

    Ok(())
}
