use crate::*;

/// Edges sharing a depth-limited pool all complete even when the pool forces
/// them through its delayed queue.
#[test]
fn pool_limited_edges_all_complete() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        &[
            "pool narrow",
            "  depth = 1",
            TOUCH_RULE,
            "build a: touch in",
            "  pool = narrow",
            "build b: touch in",
            "  pool = narrow",
            "build c: touch in",
            "  pool = narrow",
            "",
        ]
        .join("\n"),
    )?;
    space.write("in", "")?;
    let out = space.run_expect(&mut kunai_command(vec!["-j", "4", "a", "b", "c"]))?;
    assert_output_contains(&out, "ran 3 tasks");
    assert!(space.read("a").is_ok());
    assert!(space.read("b").is_ok());
    assert!(space.read("c").is_ok());
    Ok(())
}

/// The intrinsic console pool serializes but does not break builds.
#[test]
fn console_pool_builds() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        &[
            TOUCH_RULE,
            "build loud: touch in",
            "  pool = console",
            "build quiet: touch in",
            "",
        ]
        .join("\n"),
    )?;
    space.write("in", "")?;
    let out = space.run_expect(&mut kunai_command(vec!["loud", "quiet"]))?;
    assert_output_contains(&out, "ran 2 tasks");
    Ok(())
}

/// Parallel workers on a wide graph.
#[test]
fn parallel_build_completes() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    let mut manifest = String::from(TOUCH_RULE);
    for i in 0..8 {
        manifest.push_str(&format!("build out{}: touch in\n", i));
        manifest.push_str(&format!("build final{}: touch out{}\n", i, i));
    }
    space.write("build.ninja", &manifest)?;
    space.write("in", "")?;
    let finals: Vec<String> = (0..8).map(|i| format!("final{}", i)).collect();
    let mut args = vec!["-j", "8"];
    args.extend(finals.iter().map(|s| s.as_str()));
    let out = space.run_expect(&mut kunai_command(args))?;
    assert_output_contains(&out, "ran 16 tasks");
    Ok(())
}
