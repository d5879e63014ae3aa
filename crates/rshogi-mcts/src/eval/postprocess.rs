//! 推論出力の後処理

/// 合法手の添字だけを取り出して softmax する
///
/// 最大値を引いてから exp を取る。添字が範囲外の手は確率0。
/// `out` は `indices` と同じ順に確率で埋められる。
pub fn softmax_legal(logits: &[f32], indices: &[u32], temperature: f32, out: &mut Vec<f32>) {
    out.clear();
    if indices.is_empty() {
        return;
    }
    let logit = |idx: u32| logits.get(idx as usize).copied().unwrap_or(f32::NEG_INFINITY);
    let max = indices.iter().map(|&i| logit(i)).fold(f32::NEG_INFINITY, f32::max);
    if !max.is_finite() {
        // 有効な出力がひとつもない
        let p = 1.0 / indices.len() as f32;
        out.resize(indices.len(), p);
        return;
    }
    let mut sum = 0.0f32;
    for &i in indices {
        let e = ((logit(i) - max) / temperature).exp();
        sum += e;
        out.push(e);
    }
    for p in out.iter_mut() {
        *p /= sum;
    }
}

/// value head の2出力から手番側の価値を得る
#[inline]
pub fn value_from_logits(v0: f32, v1: f32, temperature: f32, scale: f32) -> f32 {
    ((v0 - v1) / temperature).tanh() * scale
}
